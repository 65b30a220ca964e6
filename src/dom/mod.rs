//! Host-owned document tree.
//!
//! The bridge never touches nodes directly: every node a script can see is
//! addressed by a [`Handle`] issued by the document that owns it. The
//! [`DocumentTree`] trait is the surface the dispatch table consumes and
//! [`HtmlDocument`] is the `kuchiki`-backed implementation used by the
//! binary and the tests.

pub mod document;
pub mod handles;
pub mod page;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use document::HtmlDocument;
pub use handles::{HandleAllocator, HandleTable};
pub use page::{HostUi, Page};

/// Opaque token referencing a node owned by one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum DomError {
    #[error("handle {0} does not resolve to a live node")]
    HandleResolution(Handle),
    #[error("invalid selector '{0}'")]
    InvalidSelector(String),
    #[error("node {0} is not an element")]
    NotAnElement(Handle),
    #[error("node {0} is not a document")]
    NotADocument(Handle),
    #[error("node {0} does not embed a document")]
    NoContentDocument(Handle),
    #[error("failed to resolve url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Operations the bridge needs from a document.
///
/// Handles passed in must have been issued by this document (or be the
/// handle of a document it embeds, for the `open`/`write`/`close` stream).
pub trait DocumentTree {
    /// Handle of the document node itself.
    fn handle(&self) -> Handle;

    /// Handle of the embedding document, if this document lives in a frame.
    fn parent_document(&self) -> Option<Handle>;

    fn find_first_matching(&self, selector: &str) -> Result<Option<Handle>, DomError>;

    /// Every element below the document node, in tree order.
    fn all_descendants(&self) -> Vec<Handle>;

    fn attribute(&self, node: Handle, name: &str) -> Result<Option<String>, DomError>;

    fn set_attribute(&self, node: Handle, name: &str, value: &str) -> Result<(), DomError>;

    fn text_content(&self, node: Handle) -> Result<String, DomError>;

    fn set_text_content(&self, node: Handle, value: &str) -> Result<(), DomError>;

    fn inner_html(&self, node: Handle) -> Result<String, DomError>;

    fn set_inner_html(&self, node: Handle, value: &str) -> Result<(), DomError>;

    /// Resolve the document embedded by a frame-like element.
    fn content_document(&self, node: Handle) -> Result<Handle, DomError>;

    fn open(&self, document: Handle) -> Result<(), DomError>;

    fn write(&self, document: Handle, markup: &str) -> Result<(), DomError>;

    fn close(&self, document: Handle) -> Result<(), DomError>;

    /// Resolve `url` against the document's base url.
    fn resolve_url(&self, url: &str) -> Result<Url, DomError>;
}
