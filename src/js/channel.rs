//! Shared-memory rendezvous between the host and one sandbox.
//!
//! The host writes a message into a fixed-capacity byte region and then
//! publishes its length; the sandbox thread blocks on the length cell until
//! it leaves zero, copies the payload out and resets the cell. Traffic in
//! the other direction is posted asynchronously over an unbounded queue, so
//! the host never blocks on a sandbox.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::error::{BridgeError, BridgeResult};
use super::protocol::{Call, Event, HostMessage, Reply, SandboxMessage};

/// Default capacity of the payload region: 10 MiB.
pub const DEFAULT_CAPACITY: usize = 10 * 1024 * 1024;

/// Payload region plus length cell shared by one host and one sandbox.
///
/// A length of zero means nothing is pending. Writers store every payload
/// byte before releasing the length, readers acquire the length before
/// touching the payload.
pub struct ChannelBuffers {
    payload: Box<[AtomicU8]>,
    length: AtomicU32,
    terminated: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

impl ChannelBuffers {
    pub fn new(capacity: usize) -> Self {
        let payload = (0..capacity).map(|_| AtomicU8::new(0)).collect();
        Self {
            payload,
            length: AtomicU32::new(0),
            terminated: AtomicBool::new(false),
            lock: Mutex::new(()),
            signal: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    /// Current value of the length cell.
    pub fn pending_len(&self) -> u32 {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Publish `bytes` and wake one waiter.
    pub fn write_bytes(&self, bytes: &[u8]) -> BridgeResult<()> {
        if self.is_terminated() {
            return Err(BridgeError::Terminated);
        }
        let capacity = self.capacity();
        if bytes.len() > capacity || u32::try_from(bytes.len()).is_err() {
            return Err(BridgeError::PayloadTooLarge {
                size: bytes.len(),
                capacity,
            });
        }
        if self.pending_len() != 0 {
            return Err(BridgeError::ChannelBusy);
        }

        for (cell, byte) in self.payload.iter().zip(bytes) {
            cell.store(*byte, Ordering::Relaxed);
        }
        // Fits: checked against u32 above.
        self.length.store(bytes.len() as u32, Ordering::Release);

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.signal.notify_one();
        Ok(())
    }

    /// Block until a message is pending, copy it out and reset the length
    /// cell to zero.
    pub fn read_bytes(&self) -> BridgeResult<Vec<u8>> {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let len = loop {
            if self.is_terminated() {
                return Err(BridgeError::Terminated);
            }
            let len = self.length.load(Ordering::Acquire);
            if len != 0 {
                break len as usize;
            }
            guard = self
                .signal
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        };
        drop(guard);

        let bytes = self.payload[..len]
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect();
        self.length.store(0, Ordering::Release);
        Ok(bytes)
    }

    /// Encode `message` as compact JSON and publish it. Oversized payloads
    /// are rejected before the buffers are touched.
    pub fn write_message<T: Serialize>(&self, message: &T) -> BridgeResult<()> {
        let encoded = serde_json::to_vec(message)?;
        self.write_bytes(&encoded)
    }

    pub fn read_message<T: DeserializeOwned>(&self) -> BridgeResult<T> {
        let bytes = self.read_bytes()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Mark the channel dead and wake every blocked reader.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.signal.notify_all();
    }
}

/// Create the two ends of a fresh channel.
pub fn channel_pair(capacity: usize) -> (HostEndpoint, SandboxEndpoint) {
    let buffers = Arc::new(ChannelBuffers::new(capacity));
    let (outbound, inbound) = unbounded_channel();
    (
        HostEndpoint {
            sender: HostSender {
                buffers: Arc::clone(&buffers),
            },
            inbound,
        },
        SandboxEndpoint { buffers, outbound },
    )
}

/// Host side of a channel before it is wired to a message handler.
pub struct HostEndpoint {
    sender: HostSender,
    inbound: UnboundedReceiver<SandboxMessage>,
}

impl HostEndpoint {
    pub fn sender(&self) -> HostSender {
        self.sender.clone()
    }

    /// Deliver every inbound sandbox message to `handler` on a local task,
    /// then run `on_close` once the sandbox side is gone. Must be called from
    /// within a `LocalSet`.
    pub fn on_message<F, C>(self, mut handler: F, on_close: C) -> JoinHandle<()>
    where
        F: FnMut(SandboxMessage) + 'static,
        C: FnOnce() + 'static,
    {
        let mut inbound = self.inbound;
        tokio::task::spawn_local(async move {
            while let Some(message) = inbound.recv().await {
                handler(message);
            }
            tracing::debug!(target: "bridge", "sandbox message stream closed");
            on_close();
        })
    }

    pub fn into_parts(self) -> (HostSender, UnboundedReceiver<SandboxMessage>) {
        (self.sender, self.inbound)
    }
}

/// Non-blocking host-to-sandbox writer.
#[derive(Clone)]
pub struct HostSender {
    buffers: Arc<ChannelBuffers>,
}

impl HostSender {
    pub fn send(&self, message: &HostMessage) -> BridgeResult<()> {
        self.buffers.write_message(message)
    }

    pub fn reply(&self, reply: Reply) -> BridgeResult<()> {
        self.send(&HostMessage::Reply(reply))
    }

    pub fn buffers(&self) -> &Arc<ChannelBuffers> {
        &self.buffers
    }

    pub fn terminate(&self) {
        self.buffers.terminate();
    }
}

/// Sandbox side: posts to the host and blocks for its answers.
pub struct SandboxEndpoint {
    buffers: Arc<ChannelBuffers>,
    outbound: UnboundedSender<SandboxMessage>,
}

impl SandboxEndpoint {
    pub fn post(&self, message: SandboxMessage) -> BridgeResult<()> {
        if self.buffers.is_terminated() {
            return Err(BridgeError::Terminated);
        }
        self.outbound
            .send(message)
            .map_err(|_| BridgeError::Terminated)
    }

    pub fn post_event(&self, event: Event) -> BridgeResult<()> {
        self.post(SandboxMessage::Event(event))
    }

    pub fn receive(&self) -> BridgeResult<HostMessage> {
        self.buffers.read_message()
    }

    /// Synchronous remote call: post the request, then block for the reply.
    pub fn call(&self, call: Call) -> BridgeResult<Reply> {
        self.post(SandboxMessage::Call(call))?;
        match self.receive()? {
            HostMessage::Reply(reply) => Ok(reply),
            HostMessage::Command(command) => Err(BridgeError::Script(format!(
                "expected a reply, received {command:?}"
            ))),
        }
    }

    pub fn buffers(&self) -> &Arc<ChannelBuffers> {
        &self.buffers
    }

    pub fn is_terminated(&self) -> bool {
        self.buffers.is_terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn receive_yields_sent_bytes() {
        let buffers = Arc::new(ChannelBuffers::new(64));
        let reader = Arc::clone(&buffers);
        let handle = thread::spawn(move || reader.read_bytes().unwrap());

        buffers.write_bytes(b"{\"value\":\"hello\"}").unwrap();
        assert_eq!(handle.join().unwrap(), b"{\"value\":\"hello\"}");
        assert_eq!(buffers.pending_len(), 0);
    }

    #[test]
    fn payload_at_capacity_is_accepted() {
        let buffers = ChannelBuffers::new(8);
        buffers.write_bytes(&[7u8; 8]).unwrap();
        assert_eq!(buffers.pending_len(), 8);
        assert_eq!(buffers.read_bytes().unwrap(), vec![7u8; 8]);
    }

    #[test]
    fn oversized_payload_leaves_length_untouched() {
        let buffers = ChannelBuffers::new(16);
        let message = HostMessage::Reply(Reply::value("x".repeat(64)));
        let err = buffers.write_message(&message).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::PayloadTooLarge { capacity: 16, .. }
        ));
        assert_eq!(buffers.pending_len(), 0);
    }

    #[test]
    fn second_send_before_receive_is_rejected() {
        let buffers = ChannelBuffers::new(16);
        buffers.write_bytes(b"{}").unwrap();
        assert!(matches!(
            buffers.write_bytes(b"{}"),
            Err(BridgeError::ChannelBusy)
        ));
        assert_eq!(buffers.pending_len(), 2);
        buffers.read_bytes().unwrap();
        assert_eq!(buffers.pending_len(), 0);
        buffers.write_bytes(b"{}").unwrap();
    }

    #[test]
    fn terminate_wakes_blocked_reader() {
        let buffers = Arc::new(ChannelBuffers::new(16));
        let reader = Arc::clone(&buffers);
        let handle = thread::spawn(move || reader.read_bytes());
        thread::sleep(Duration::from_millis(20));

        buffers.terminate();
        assert!(matches!(
            handle.join().unwrap(),
            Err(BridgeError::Terminated)
        ));
        assert!(matches!(
            buffers.write_bytes(b"{}"),
            Err(BridgeError::Terminated)
        ));
    }

    #[test]
    fn sandbox_call_round_trip() {
        let (host, sandbox) = channel_pair(1024);
        let (sender, mut inbound) = host.into_parts();

        let worker = thread::spawn(move || {
            let mut fields = serde_json::Map::new();
            fields.insert("selector".into(), "#a".into());
            sandbox.call(Call {
                operation: "document.querySelector".into(),
                fields,
            })
        });

        let message = inbound.blocking_recv().unwrap();
        let SandboxMessage::Call(call) = message else {
            panic!("expected a call");
        };
        assert_eq!(call.operation, "document.querySelector");
        sender.reply(Reply::ptr(Some(crate::dom::Handle(5)))).unwrap();

        let reply = worker.join().unwrap().unwrap();
        assert_eq!(reply.ptr, Some(crate::dom::Handle(5)));
    }
}
