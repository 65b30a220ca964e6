use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use kuchiki::traits::*;
use kuchiki::NodeRef;
use url::Url;

use super::handles::{HandleAllocator, HandleTable};
use super::{DocumentTree, DomError, Handle};

const BLANK_DOCUMENT: &str = "<html><head></head><body></body></html>";

/// An HTML document parsed with `kuchiki`, addressable through handles.
pub struct HtmlDocument {
    root: NodeRef,
    handle: Handle,
    parent: Option<Handle>,
    base_url: Url,
    allocator: HandleAllocator,
    table: HandleTable,
    /// Content documents keyed by the handle of their frame element.
    frames: RefCell<HashMap<Handle, Rc<HtmlDocument>>>,
    write_buffer: RefCell<Option<String>>,
}

impl HtmlDocument {
    pub fn parse(
        html: &str,
        base_url: Url,
        allocator: HandleAllocator,
        parent: Option<Handle>,
    ) -> Rc<Self> {
        let root = kuchiki::parse_html().one(html);
        let handle = allocator.allocate();
        let table = HandleTable::new(allocator.clone());
        table.bind(handle, &root);
        tracing::debug!(target: "dom", %handle, ?parent, url = %base_url, "parsed document");
        Rc::new(Self {
            root,
            handle,
            parent,
            base_url,
            allocator,
            table,
            frames: RefCell::new(HashMap::new()),
            write_buffer: RefCell::new(None),
        })
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Serialize the whole document.
    pub fn to_html(&self) -> String {
        self.root.to_string()
    }

    /// Content documents of every frame element, in tree order. Frames are
    /// materialized on first access.
    pub fn frame_documents(&self) -> Vec<Rc<HtmlDocument>> {
        let Ok(frames) = self.root.select("iframe, frame") else {
            return Vec::new();
        };
        let handles: Vec<Handle> = frames
            .map(|frame| self.table.handle_for(frame.as_node()))
            .collect();

        handles
            .into_iter()
            .filter_map(|handle| {
                self.content_document(handle).ok()?;
                self.frames.borrow().get(&handle).cloned()
            })
            .collect()
    }

    fn node(&self, handle: Handle) -> Result<NodeRef, DomError> {
        self.table.resolve(handle)
    }

    fn element(&self, handle: Handle) -> Result<NodeRef, DomError> {
        let node = self.node(handle)?;
        if node.as_element().is_none() {
            return Err(DomError::NotAnElement(handle));
        }
        Ok(node)
    }

    fn remove_children(node: &NodeRef) {
        let children: Vec<NodeRef> = node.children().collect();
        for child in children {
            child.detach();
        }
    }

    fn after_mutation(&self) {
        self.table.release_detached(&self.root);
        self.frames
            .borrow_mut()
            .retain(|frame, _| self.table.resolve(*frame).is_ok());
    }

    /// Run `f` against the document addressed by `handle`: this document or
    /// one it embeds directly.
    fn with_stream_target<T>(
        &self,
        handle: Handle,
        f: impl FnOnce(&HtmlDocument) -> T,
    ) -> Result<T, DomError> {
        if handle == self.handle {
            return Ok(f(self));
        }
        let embedded = self
            .frames
            .borrow()
            .values()
            .find(|doc| doc.handle == handle)
            .cloned();
        match embedded {
            Some(doc) => Ok(f(doc.as_ref())),
            None => {
                self.node(handle)?;
                Err(DomError::NotADocument(handle))
            }
        }
    }

    fn stream_open(&self) {
        Self::remove_children(&self.root);
        *self.write_buffer.borrow_mut() = Some(String::new());
        self.after_mutation();
    }

    fn stream_write(&self, markup: &str) {
        if self.write_buffer.borrow().is_none() {
            self.stream_open();
        }
        if let Some(buffer) = self.write_buffer.borrow_mut().as_mut() {
            buffer.push_str(markup);
        }
    }

    fn stream_close(&self) {
        let Some(buffer) = self.write_buffer.borrow_mut().take() else {
            return;
        };
        let parsed = kuchiki::parse_html().one(buffer.as_str());
        let children: Vec<NodeRef> = parsed.children().collect();
        for child in children {
            self.root.append(child);
        }
        self.after_mutation();
    }
}

impl DocumentTree for HtmlDocument {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn parent_document(&self) -> Option<Handle> {
        self.parent
    }

    fn find_first_matching(&self, selector: &str) -> Result<Option<Handle>, DomError> {
        let mut matches = self
            .root
            .select(selector)
            .map_err(|_| DomError::InvalidSelector(selector.to_string()))?;
        Ok(matches
            .next()
            .map(|element| self.table.handle_for(element.as_node())))
    }

    fn all_descendants(&self) -> Vec<Handle> {
        self.root
            .descendants()
            .filter(|node| node.as_element().is_some())
            .map(|node| self.table.handle_for(&node))
            .collect()
    }

    fn attribute(&self, node: Handle, name: &str) -> Result<Option<String>, DomError> {
        let node = self.element(node)?;
        let value = node
            .as_element()
            .and_then(|element| element.attributes.borrow().get(name).map(str::to_string));
        Ok(value)
    }

    fn set_attribute(&self, node: Handle, name: &str, value: &str) -> Result<(), DomError> {
        let target = self.element(node)?;
        if let Some(element) = target.as_element() {
            element
                .attributes
                .borrow_mut()
                .insert(name, value.to_string());
        }
        Ok(())
    }

    fn text_content(&self, node: Handle) -> Result<String, DomError> {
        Ok(self.node(node)?.text_contents())
    }

    fn set_text_content(&self, node: Handle, value: &str) -> Result<(), DomError> {
        let target = self.node(node)?;
        if let Some(text) = target.as_text() {
            *text.borrow_mut() = value.to_string();
            return Ok(());
        }
        Self::remove_children(&target);
        if !value.is_empty() {
            target.append(NodeRef::new_text(value));
        }
        self.after_mutation();
        Ok(())
    }

    fn inner_html(&self, node: Handle) -> Result<String, DomError> {
        let target = self.node(node)?;
        Ok(target.children().map(|child| child.to_string()).collect())
    }

    fn set_inner_html(&self, node: Handle, value: &str) -> Result<(), DomError> {
        let target = self.element(node)?;
        let fragment =
            kuchiki::parse_html().one(format!("<html><head></head><body>{value}</body></html>"));
        Self::remove_children(&target);
        if let Ok(body) = fragment.select_first("body") {
            let children: Vec<NodeRef> = body.as_node().children().collect();
            for child in children {
                target.append(child);
            }
        }
        self.after_mutation();
        Ok(())
    }

    fn content_document(&self, node: Handle) -> Result<Handle, DomError> {
        let frame = self.element(node)?;
        if let Some(existing) = self.frames.borrow().get(&node) {
            return Ok(existing.handle);
        }

        let Some(element) = frame.as_element() else {
            return Err(DomError::NotAnElement(node));
        };
        if !matches!(&*element.name.local, "iframe" | "frame") {
            return Err(DomError::NoContentDocument(node));
        }

        let (srcdoc, src) = {
            let attributes = element.attributes.borrow();
            (
                attributes.get("srcdoc").map(str::to_string),
                attributes.get("src").map(str::to_string),
            )
        };
        let base_url = src
            .filter(|_| srcdoc.is_none())
            .and_then(|src| self.base_url.join(&src).ok())
            .unwrap_or_else(|| self.base_url.clone());
        let html = srcdoc.as_deref().unwrap_or(BLANK_DOCUMENT);

        let child = HtmlDocument::parse(html, base_url, self.allocator.clone(), Some(self.handle));
        let handle = child.handle;
        self.frames.borrow_mut().insert(node, child);
        Ok(handle)
    }

    fn open(&self, document: Handle) -> Result<(), DomError> {
        self.with_stream_target(document, HtmlDocument::stream_open)
    }

    fn write(&self, document: Handle, markup: &str) -> Result<(), DomError> {
        self.with_stream_target(document, |doc| doc.stream_write(markup))
    }

    fn close(&self, document: Handle) -> Result<(), DomError> {
        self.with_stream_target(document, HtmlDocument::stream_close)
    }

    fn resolve_url(&self, url: &str) -> Result<Url, DomError> {
        Ok(self.base_url.join(url)?)
    }
}
