//! Host/sandbox script bridge.
//!
//! Each document gets its own sandbox thread. Sandbox script reaches the
//! host document through blocking calls over a shared-buffer [`channel`];
//! the host answers them from the [`dispatch`] table without ever blocking
//! on a sandbox.

pub mod backend;
pub mod channel;
pub mod delegation;
pub mod dispatch;
pub mod error;
pub mod processor;
pub mod protocol;
pub mod sandbox;
pub mod script;

pub use backend::{BackendInstance, BackendManager, BackendState};
pub use error::{BridgeError, BridgeResult};
pub use processor::{run_document_scripts, ScriptExecutionSummary};
pub use sandbox::{HostCapabilities, QuickJsRuntime, SandboxRegistry, SandboxRuntime};
