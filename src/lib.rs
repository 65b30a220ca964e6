// Library exports for the binary and integration tests

pub mod config;
pub mod dom;
pub mod js;

pub use config::{BridgeConfig, ConfigError};
pub use dom::{DocumentTree, Handle, HtmlDocument, HostUi, Page};
pub use js::{BackendManager, BridgeError};
