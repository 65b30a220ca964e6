//! Sandbox execution units.
//!
//! A sandbox kind is a named [`SandboxRuntime`] that turns the sandbox end
//! of a channel into a running [`ExecutionUnit`]: an OS thread that talks
//! to the host only through that channel.

pub mod quickjs;

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use serde_json::Value as JsonValue;

use super::channel::{ChannelBuffers, SandboxEndpoint};
use super::error::{BridgeError, BridgeResult};
use super::protocol::{Command, Event, EventKind, HostMessage};
use crate::dom::Handle;

pub use quickjs::QuickJsRuntime;

/// What the host offers for running sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Atomics plus threads, required by the shared-buffer channel.
    pub shared_memory: bool,
}

impl HostCapabilities {
    pub fn detect() -> Self {
        let shared_memory = cfg!(target_has_atomic = "32")
            && !cfg!(all(target_family = "wasm", not(target_feature = "atomics")));
        Self { shared_memory }
    }
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self::detect()
    }
}

/// Script engine driven by the worker loop on the sandbox thread.
pub trait ScriptEngine {
    /// Called once with the handle the host sent in the `ready` ack.
    fn bind_document(&mut self, document: Option<Handle>) -> Result<(), String>;

    /// Evaluate `source` and return its completion value as JSON, `None`
    /// for `undefined`.
    fn eval(&mut self, source: &str) -> Result<Option<JsonValue>, String>;
}

pub trait SandboxRuntime {
    /// Start an execution unit bound to `endpoint`.
    fn spawn(&self, label: &str, endpoint: SandboxEndpoint) -> BridgeResult<ExecutionUnit>;
}

/// A running sandbox thread. Dropping the unit terminates it.
pub struct ExecutionUnit {
    buffers: Arc<ChannelBuffers>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ExecutionUnit {
    pub fn new(buffers: Arc<ChannelBuffers>, thread: thread::JoinHandle<()>) -> Self {
        Self {
            buffers,
            thread: Some(thread),
        }
    }

    /// Forcefully stop the unit. The thread is woken and left to unwind on
    /// its own; the host never joins it.
    pub fn terminate(&mut self) {
        self.buffers.terminate();
        self.thread.take();
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Start a sandbox thread that builds its engine with `make_engine` and
/// then serves the channel until it is terminated.
pub fn spawn_worker<E, F>(label: &str, endpoint: SandboxEndpoint, make_engine: F) -> BridgeResult<ExecutionUnit>
where
    E: ScriptEngine,
    F: FnOnce(Rc<SandboxEndpoint>) -> Result<E, String> + Send + 'static,
{
    let buffers = Arc::clone(endpoint.buffers());
    let thread_label = label.to_string();
    let thread = thread::Builder::new()
        .name(format!("sandbox-{label}"))
        .spawn(move || {
            let endpoint = Rc::new(endpoint);
            let mut engine = match make_engine(Rc::clone(&endpoint)) {
                Ok(engine) => engine,
                Err(err) => {
                    tracing::error!(target: "sandbox", label = %thread_label, error = %err, "failed to create script engine");
                    return;
                }
            };
            match run_worker(&endpoint, &mut engine) {
                Ok(()) | Err(BridgeError::Terminated) => {
                    tracing::debug!(target: "sandbox", label = %thread_label, "sandbox stopped");
                }
                Err(err) => {
                    tracing::error!(target: "sandbox", label = %thread_label, error = %err, "sandbox loop failed");
                }
            }
        })
        .map_err(|err| BridgeError::Spawn(err.to_string()))?;

    Ok(ExecutionUnit::new(buffers, thread))
}

/// Sandbox side of the lifecycle: `ready`, then `wait` / `eval` / `done`
/// until the channel is terminated.
pub fn run_worker<E: ScriptEngine>(endpoint: &SandboxEndpoint, engine: &mut E) -> BridgeResult<()> {
    endpoint.post_event(Event::new(EventKind::Ready))?;
    if let HostMessage::Reply(ack) = endpoint.receive()? {
        engine.bind_document(ack.ptr).map_err(BridgeError::Script)?;
    }

    loop {
        endpoint.post_event(Event::new(EventKind::Wait))?;
        let js = match endpoint.receive()? {
            HostMessage::Command(Command::Eval { js }) => js,
            HostMessage::Reply(_) => continue,
        };

        let outcome = engine.eval(&js);
        if endpoint.is_terminated() {
            return Err(BridgeError::Terminated);
        }
        if let Err(message) = &outcome {
            tracing::warn!(target: "sandbox", error = %message, "script raised an exception");
        }
        endpoint.post_event(Event::done(outcome))?;
        endpoint.receive()?;
    }
}

/// Sandbox kinds known to the host, by name.
#[derive(Clone, Default)]
pub struct SandboxRegistry {
    runtimes: HashMap<String, Rc<dyn SandboxRuntime>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `quickjs` kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(QuickJsRuntime::NAME, Rc::new(QuickJsRuntime::default()));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, runtime: Rc<dyn SandboxRuntime>) {
        self.runtimes.insert(name.into(), runtime);
    }

    pub fn get(&self, name: &str) -> BridgeResult<Rc<dyn SandboxRuntime>> {
        self.runtimes
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownSandboxKind(name.to_string()))
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.runtimes.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::js::channel::channel_pair;
    use crate::js::protocol::{Reply, SandboxMessage};

    struct Echo;

    impl ScriptEngine for Echo {
        fn bind_document(&mut self, _document: Option<Handle>) -> Result<(), String> {
            Ok(())
        }

        fn eval(&mut self, source: &str) -> Result<Option<JsonValue>, String> {
            Ok(Some(JsonValue::String(source.to_string())))
        }
    }

    #[test]
    fn worker_follows_lifecycle() {
        let (host, sandbox) = channel_pair(1024);
        let (sender, mut inbound) = host.into_parts();
        let mut unit = spawn_worker("echo", sandbox, |_| Ok(Echo)).unwrap();

        let next = |inbound: &mut tokio::sync::mpsc::UnboundedReceiver<SandboxMessage>| {
            match inbound.blocking_recv().unwrap() {
                SandboxMessage::Event(event) => event,
                other => panic!("unexpected {other:?}"),
            }
        };

        assert_eq!(next(&mut inbound).kind, EventKind::Ready);
        sender.reply(Reply::ack()).unwrap();
        assert_eq!(next(&mut inbound).kind, EventKind::Wait);
        sender.send(&HostMessage::eval("echo me")).unwrap();
        let done = next(&mut inbound);
        assert_eq!(done.kind, EventKind::Done);
        assert_eq!(done.value, Some(JsonValue::String("echo me".into())));
        sender.reply(Reply::ack()).unwrap();
        assert_eq!(next(&mut inbound).kind, EventKind::Wait);

        unit.terminate();
        assert!(inbound.blocking_recv().is_none());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let registry = SandboxRegistry::with_defaults();
        assert_eq!(registry.kinds(), vec!["quickjs".to_string()]);
        assert!(matches!(
            registry.get("spidermonkey"),
            Err(BridgeError::UnknownSandboxKind(_))
        ));
    }
}
