//! Backend lifecycle: one sandbox per document, created on demand and
//! replaced or torn down by force.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde_json::Value as JsonValue;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use super::channel::{channel_pair, HostSender};
use super::dispatch::{dispatch, CallContext, Responder};
use super::error::{BridgeError, BridgeResult};
use super::protocol::{Event, EventKind, HostMessage, Reply, SandboxMessage};
use super::sandbox::{ExecutionUnit, HostCapabilities, SandboxRegistry};
use crate::config::BridgeConfig;
use crate::dom::{DocumentTree, Handle, HostUi};

const UNSUPPORTED_ALERT: &str =
    "This page needs shared memory and atomics to run its scripts, which this environment does not provide.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Spawning,
    AwaitingReady,
    Idle,
    /// An evaluation is queued until the sandbox reports `wait`.
    AwaitingEvalAck,
    /// The `eval` command is being handed to the sandbox.
    Evaluating,
    AwaitingDone,
    Terminated,
}

type EventHandler = Box<dyn FnOnce(&BackendInstance, Event)>;

/// Single-shot handler per lifecycle event.
#[derive(Default)]
struct EventSlots {
    ready: RefCell<Option<EventHandler>>,
    wait: RefCell<Option<EventHandler>>,
    done: RefCell<Option<EventHandler>>,
}

impl EventSlots {
    fn slot(&self, kind: EventKind) -> &RefCell<Option<EventHandler>> {
        match kind {
            EventKind::Ready => &self.ready,
            EventKind::Wait => &self.wait,
            EventKind::Done => &self.done,
        }
    }

    fn set(&self, kind: EventKind, handler: EventHandler) {
        *self.slot(kind).borrow_mut() = Some(handler);
    }

    /// Remove the handler so it cannot fire twice.
    fn take(&self, kind: EventKind) -> Option<EventHandler> {
        self.slot(kind).borrow_mut().take()
    }

    fn clear(&self) {
        for kind in [EventKind::Ready, EventKind::Wait, EventKind::Done] {
            // Dropped outside the borrow: a handler's captures may run code on drop.
            let handler = self.take(kind);
            drop(handler);
        }
    }
}

/// Runtime state binding one document to one sandbox.
pub struct BackendInstance {
    document: Rc<dyn DocumentTree>,
    kind: String,
    sender: HostSender,
    unit: RefCell<Option<ExecutionUnit>>,
    handlers: EventSlots,
    parked_wait: Cell<bool>,
    state: Cell<BackendState>,
    /// Delegation chain of the evaluation in progress.
    chain: RefCell<Vec<Handle>>,
    eval_gate: AsyncMutex<()>,
    pump: RefCell<Option<JoinHandle<()>>>,
}

impl BackendInstance {
    fn new(document: Rc<dyn DocumentTree>, kind: &str, sender: HostSender) -> Self {
        Self {
            document,
            kind: kind.to_string(),
            sender,
            unit: RefCell::new(None),
            handlers: EventSlots::default(),
            parked_wait: Cell::new(false),
            state: Cell::new(BackendState::Spawning),
            chain: RefCell::new(Vec::new()),
            eval_gate: AsyncMutex::new(()),
            pump: RefCell::new(None),
        }
    }

    pub fn document(&self) -> Rc<dyn DocumentTree> {
        Rc::clone(&self.document)
    }

    pub fn document_handle(&self) -> Handle {
        self.document.handle()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn state(&self) -> BackendState {
        self.state.get()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.get() == BackendState::Terminated
    }

    /// Whether the sandbox thread is still alive.
    pub fn is_running(&self) -> bool {
        self.unit
            .borrow()
            .as_ref()
            .is_some_and(ExecutionUnit::is_running)
    }

    fn set_state(&self, state: BackendState) {
        if self.is_terminated() {
            return;
        }
        tracing::trace!(target: "bridge", document = %self.document_handle(), ?state, "backend state");
        self.state.set(state);
    }

    /// Register the handler for the next `kind` event. A parked `wait`
    /// fires the new handler immediately.
    fn on(&self, kind: EventKind, handler: EventHandler) {
        if kind == EventKind::Wait && self.parked_wait.replace(false) {
            handler(self, Event::new(EventKind::Wait));
            return;
        }
        self.handlers.set(kind, handler);
    }

    fn handle_event(&self, event: Event) {
        let kind = event.kind;
        match self.handlers.take(kind) {
            Some(handler) => handler(self, event),
            None if kind == EventKind::Wait => {
                tracing::trace!(target: "bridge", document = %self.document_handle(), "parking wait");
                self.parked_wait.set(true);
            }
            None => {
                tracing::debug!(target: "bridge", document = %self.document_handle(), ?kind, "acknowledging unhandled event");
                self.reply(Reply::ack());
            }
        }
    }

    fn receive(&self, message: SandboxMessage, manager: &Rc<BackendManager>) {
        match message {
            SandboxMessage::Event(event) => self.handle_event(event),
            SandboxMessage::Call(call) => {
                tracing::trace!(target: "bridge", document = %self.document_handle(), operation = %call.operation, "call");
                let ctx = CallContext {
                    document: self.document(),
                    manager: Rc::clone(manager),
                    chain: self.chain.borrow().clone(),
                };
                let sender = self.sender.clone();
                let responder = Responder::new(call.operation.clone(), move |reply| {
                    send_reply(&sender, reply);
                });
                dispatch(&call.operation, call.fields, responder, ctx);
            }
            SandboxMessage::Other(other) => {
                tracing::debug!(target: "bridge", document = %self.document_handle(), message = %other, "unrecognized sandbox message");
                self.reply(Reply::ack());
            }
        }
    }

    fn reply(&self, reply: Reply) {
        send_reply(&self.sender, reply);
    }

    /// Run one evaluation. Evaluations on the same backend queue behind
    /// each other.
    async fn run(&self, js: String, chain: Vec<Handle>) -> BridgeResult<Option<JsonValue>> {
        let _turn = self.eval_gate.lock().await;
        if self.is_terminated() {
            return Err(BridgeError::Cancelled);
        }
        *self.chain.borrow_mut() = chain;

        let (sent_tx, sent_rx) = oneshot::channel::<BridgeResult<()>>();
        let (done_tx, done_rx) = oneshot::channel::<Event>();
        self.set_state(BackendState::AwaitingEvalAck);

        self.on(
            EventKind::Done,
            Box::new(move |instance: &BackendInstance, event: Event| {
                instance.reply(Reply::ack());
                instance.set_state(BackendState::Idle);
                let _ = done_tx.send(event);
            }),
        );
        self.on(
            EventKind::Wait,
            Box::new(move |instance: &BackendInstance, _event: Event| {
                instance.set_state(BackendState::Evaluating);
                let sent = instance.sender.send(&HostMessage::eval(js));
                match &sent {
                    Ok(()) => instance.set_state(BackendState::AwaitingDone),
                    Err(err) => {
                        tracing::warn!(target: "bridge", document = %instance.document_handle(), error = %err, "failed to send eval");
                        // Releases the sandbox, which goes back to `wait`.
                        instance.reply(Reply::ack());
                        instance.handlers.take(EventKind::Done);
                        instance.set_state(BackendState::Idle);
                    }
                }
                let _ = sent_tx.send(sent);
            }),
        );

        let outcome = completion(sent_rx, done_rx).await;

        self.chain.borrow_mut().clear();
        outcome
    }

    /// Force-stop the sandbox and drop every pending handler. Awaiting
    /// evaluations resolve with [`BridgeError::Cancelled`].
    fn terminate(&self) {
        self.state.set(BackendState::Terminated);
        self.sender.terminate();
        let unit = self.unit.borrow_mut().take();
        drop(unit);
        self.handlers.clear();
        if let Some(pump) = self.pump.borrow_mut().take() {
            pump.abort();
        }
    }
}

/// Wait for the `eval` command to go out, then for the matching `done`.
async fn completion(
    sent: oneshot::Receiver<BridgeResult<()>>,
    done: oneshot::Receiver<Event>,
) -> BridgeResult<Option<JsonValue>> {
    sent.await.map_err(|_| BridgeError::Cancelled)??;
    let event = done.await.map_err(|_| BridgeError::Cancelled)?;
    match event.error {
        Some(message) => Err(BridgeError::Script(message)),
        None => Ok(event.value),
    }
}

fn send_reply(sender: &HostSender, reply: Reply) {
    match sender.reply(reply) {
        Ok(()) => {}
        Err(BridgeError::Terminated) => {
            tracing::debug!(target: "bridge", "dropping reply to terminated sandbox");
        }
        Err(err @ BridgeError::PayloadTooLarge { .. }) => {
            tracing::warn!(target: "bridge", error = %err, "reply too large, sending error instead");
            if let Err(err) = sender.reply(Reply::error(err.to_string())) {
                tracing::error!(target: "bridge", error = %err, "failed to send error reply");
            }
        }
        Err(err) => {
            tracing::error!(target: "bridge", error = %err, "failed to send reply");
        }
    }
}

/// Registry of live backends, keyed by document handle.
pub struct BackendManager {
    config: BridgeConfig,
    runtimes: SandboxRegistry,
    capabilities: HostCapabilities,
    ui: Rc<dyn HostUi>,
    instances: RefCell<HashMap<Handle, Rc<BackendInstance>>>,
}

impl BackendManager {
    pub fn new(config: BridgeConfig, ui: Rc<dyn HostUi>) -> Rc<Self> {
        let runtimes = config.sandbox_registry();
        Self::with_runtimes(config, ui, runtimes, HostCapabilities::detect())
    }

    pub fn with_runtimes(
        config: BridgeConfig,
        ui: Rc<dyn HostUi>,
        runtimes: SandboxRegistry,
        capabilities: HostCapabilities,
    ) -> Rc<Self> {
        Rc::new(Self {
            config,
            runtimes,
            capabilities,
            ui,
            instances: RefCell::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn ui(&self) -> &Rc<dyn HostUi> {
        &self.ui
    }

    pub fn instance(&self, document: Handle) -> Option<Rc<BackendInstance>> {
        self.instances.borrow().get(&document).cloned()
    }

    /// Number of live backends.
    pub fn len(&self) -> usize {
        self.instances.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.borrow().is_empty()
    }

    /// Return the backend for `document`, starting one if none exists or
    /// the existing one runs a different kind. Resolves once the sandbox
    /// has reported `ready`.
    pub async fn ensure_backend(
        self: &Rc<Self>,
        document: Rc<dyn DocumentTree>,
        kind: &str,
    ) -> BridgeResult<Rc<BackendInstance>> {
        let handle = document.handle();
        if let Some(existing) = self.instance(handle) {
            if existing.kind == kind && !existing.is_terminated() {
                return Ok(existing);
            }
            tracing::info!(target: "bridge", document = %handle, from = %existing.kind, to = %kind, "replacing backend");
            self.stop(handle);
        }

        if !self.capabilities.shared_memory {
            tracing::error!(target: "bridge", document = %handle, "shared memory unavailable");
            self.ui.alert(UNSUPPORTED_ALERT);
            return Err(BridgeError::UnsupportedEnvironment);
        }
        let runtime = self.runtimes.get(kind)?;

        let (endpoint, sandbox_end) = channel_pair(self.config.buffer_capacity);
        let instance = Rc::new(BackendInstance::new(document, kind, endpoint.sender()));
        let unit = runtime.spawn(&format!("{kind}-{handle}"), sandbox_end)?;
        *instance.unit.borrow_mut() = Some(unit);

        let (ready_tx, ready_rx) = oneshot::channel();
        instance.on(
            EventKind::Ready,
            Box::new(move |instance: &BackendInstance, _event: Event| {
                instance.reply(Reply::ptr(Some(handle)));
                instance.set_state(BackendState::Idle);
                let _ = ready_tx.send(());
            }),
        );
        instance.set_state(BackendState::AwaitingReady);

        let on_message = {
            let instance = Rc::downgrade(&instance);
            let manager = Rc::downgrade(self);
            move |message: SandboxMessage| {
                if let (Some(instance), Some(manager)) = (instance.upgrade(), manager.upgrade()) {
                    instance.receive(message, &manager);
                }
            }
        };
        let on_close = {
            let instance = Rc::downgrade(&instance);
            let manager: Weak<Self> = Rc::downgrade(self);
            move || {
                let (Some(instance), Some(manager)) = (instance.upgrade(), manager.upgrade()) else {
                    return;
                };
                if !instance.is_terminated() {
                    tracing::warn!(target: "bridge", document = %instance.document_handle(), "sandbox exited unexpectedly");
                    manager.forget(&instance);
                    instance.terminate();
                }
            }
        };
        *instance.pump.borrow_mut() = Some(endpoint.on_message(on_message, on_close));

        self.instances.borrow_mut().insert(handle, Rc::clone(&instance));
        tracing::info!(target: "bridge", document = %handle, %kind, backends = self.len(), "started backend");

        ready_rx.await.map_err(|_| BridgeError::Cancelled)?;
        Ok(instance)
    }

    /// Evaluate `script` in the backend of `document`, returning the
    /// script's completion value (`None` for `undefined`).
    ///
    /// With no sandbox kind, or a blank script, nothing happens and no
    /// backend is created.
    pub async fn evaluate(
        self: &Rc<Self>,
        document: Rc<dyn DocumentTree>,
        kind: Option<&str>,
        script: &str,
    ) -> BridgeResult<Option<JsonValue>> {
        self.evaluate_with_chain(document, kind, script, Vec::new()).await
    }

    /// [`BackendManager::evaluate`] on behalf of the documents in `chain`,
    /// whose own evaluations are blocked on this one.
    pub async fn evaluate_with_chain(
        self: &Rc<Self>,
        document: Rc<dyn DocumentTree>,
        kind: Option<&str>,
        script: &str,
        chain: Vec<Handle>,
    ) -> BridgeResult<Option<JsonValue>> {
        let Some(kind) = kind else {
            return Ok(None);
        };
        let js = script.trim();
        if js.is_empty() {
            return Ok(None);
        }
        let instance = self.ensure_backend(document, kind).await?;
        instance.run(js.to_string(), chain).await
    }

    /// Force-stop the backend of `document`, if any.
    pub fn stop(&self, document: Handle) {
        let removed = self.instances.borrow_mut().remove(&document);
        if let Some(instance) = removed {
            tracing::info!(target: "bridge", %document, kind = %instance.kind, "stopping backend");
            instance.terminate();
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<Rc<BackendInstance>> = self
            .instances
            .borrow_mut()
            .drain()
            .map(|(_, instance)| instance)
            .collect();
        if !drained.is_empty() {
            tracing::info!(target: "bridge", count = drained.len(), "stopping all backends");
        }
        for instance in drained {
            instance.terminate();
        }
    }

    fn forget(&self, instance: &Rc<BackendInstance>) {
        let mut instances = self.instances.borrow_mut();
        let handle = instance.document_handle();
        if instances
            .get(&handle)
            .is_some_and(|current| Rc::ptr_eq(current, instance))
        {
            instances.remove(&handle);
        }
    }
}

impl Drop for BackendManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}
