//! Host-side handlers for calls made by sandbox script.

use std::collections::HashMap;
use std::rc::Rc;

use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::backend::BackendManager;
use super::delegation;
use super::error::{BridgeError, BridgeResult};
use super::protocol::Reply;
use crate::dom::{DocumentTree, Handle};

pub type Fields = JsonMap<String, JsonValue>;

/// Everything a handler may touch while serving one call.
#[derive(Clone)]
pub struct CallContext {
    pub document: Rc<dyn DocumentTree>,
    pub manager: Rc<BackendManager>,
    /// Documents whose evaluations are blocked on the call being served.
    pub chain: Vec<Handle>,
}

/// One-time reply channel for a call. Dropping it unanswered sends an error
/// reply so the calling sandbox is never left blocked.
pub struct Responder {
    operation: String,
    sink: Option<Box<dyn FnOnce(Reply)>>,
}

impl Responder {
    pub fn new(operation: impl Into<String>, sink: impl FnOnce(Reply) + 'static) -> Self {
        Self {
            operation: operation.into(),
            sink: Some(Box::new(sink)),
        }
    }

    pub fn respond(mut self, reply: Reply) {
        if let Some(sink) = self.sink.take() {
            sink(reply);
        }
    }

    pub fn complete(self, result: BridgeResult<Reply>) {
        match result {
            Ok(reply) => self.respond(reply),
            Err(err) => {
                tracing::warn!(target: "bridge", operation = %self.operation, error = %err, "call failed");
                self.respond(Reply::error(err.to_string()));
            }
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            tracing::warn!(target: "bridge", operation = %self.operation, "handler dropped its responder");
            sink(Reply::error(format!("{} produced no reply", self.operation)));
        }
    }
}

#[derive(Clone, Copy)]
enum Handler {
    /// Answers before returning.
    Immediate(fn(&CallContext, Fields) -> BridgeResult<Reply>),
    /// Owns the responder and may answer later.
    Deferred(fn(CallContext, Fields, Responder)),
}

lazy_static! {
    static ref DISPATCH_TABLE: HashMap<&'static str, Handler> = {
        let mut table: HashMap<&'static str, Handler> = HashMap::new();
        table.insert("document.querySelector", Handler::Immediate(query_selector));
        table.insert("document.getElementById", Handler::Immediate(get_element_by_id));
        table.insert("Element.getClassName", Handler::Immediate(get_class_name));
        table.insert("Element.setClassName", Handler::Immediate(set_class_name));
        table.insert("Element.getTextContent", Handler::Immediate(get_text_content));
        table.insert("Element.setTextContent", Handler::Immediate(set_text_content));
        table.insert("Element.getInnerHTML", Handler::Immediate(get_inner_html));
        table.insert("Element.setInnerHTML", Handler::Immediate(set_inner_html));
        table.insert("Element.getContentDocument", Handler::Immediate(get_content_document));
        table.insert("Document.open", Handler::Immediate(document_open));
        table.insert("Document.write", Handler::Immediate(document_write));
        table.insert("Document.close", Handler::Immediate(document_close));
        table.insert("location.getHref", Handler::Immediate(get_href));
        table.insert("location.setHref", Handler::Immediate(set_href));
        table.insert("alert", Handler::Immediate(alert));
        table.insert("parent", Handler::Deferred(parent));
        table
    };
}

/// Route `operation` to its handler. Unknown operations are answered with
/// an [`BridgeError::UnknownOperation`] error reply.
pub fn dispatch(operation: &str, fields: Fields, responder: Responder, ctx: CallContext) {
    match DISPATCH_TABLE.get(operation).copied() {
        Some(Handler::Immediate(handler)) => responder.complete(handler(&ctx, fields)),
        Some(Handler::Deferred(handler)) => handler(ctx, fields, responder),
        None => responder.complete(Err(BridgeError::UnknownOperation(operation.to_string()))),
    }
}

/// Names of every registered operation, sorted.
pub fn operations() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = DISPATCH_TABLE.keys().copied().collect();
    names.sort_unstable();
    names
}

fn args<T: DeserializeOwned>(operation: &str, fields: Fields) -> BridgeResult<T> {
    serde_json::from_value(JsonValue::Object(fields)).map_err(|err| BridgeError::InvalidArguments {
        operation: operation.to_string(),
        message: err.to_string(),
    })
}

#[derive(Deserialize)]
struct SelectorArgs {
    selector: String,
}

#[derive(Deserialize)]
struct IdArgs {
    id: String,
}

#[derive(Deserialize)]
struct PtrArgs {
    ptr: Handle,
}

#[derive(Deserialize)]
struct PtrValueArgs {
    ptr: Handle,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct ValueArgs {
    value: String,
}

#[derive(Deserialize)]
struct AlertArgs {
    #[serde(default)]
    msg: String,
}

#[derive(Deserialize)]
struct ParentArgs {
    prop: String,
    #[serde(default)]
    args: Vec<String>,
}

fn query_selector(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let SelectorArgs { selector } = args("document.querySelector", fields)?;
    Ok(Reply::ptr(ctx.document.find_first_matching(&selector)?))
}

fn get_element_by_id(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let IdArgs { id } = args("document.getElementById", fields)?;
    let found = ctx.document.all_descendants().into_iter().find(|node| {
        matches!(ctx.document.attribute(*node, "id"), Ok(Some(value)) if value == id)
    });
    Ok(Reply::ptr(found))
}

fn get_class_name(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrArgs { ptr } = args("Element.getClassName", fields)?;
    let class = ctx.document.attribute(ptr, "class")?.unwrap_or_default();
    Ok(Reply::value(class))
}

fn set_class_name(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrValueArgs { ptr, value } = args("Element.setClassName", fields)?;
    ctx.document.set_attribute(ptr, "class", &value)?;
    let class = ctx.document.attribute(ptr, "class")?.unwrap_or_default();
    Ok(Reply::value(class))
}

fn get_text_content(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrArgs { ptr } = args("Element.getTextContent", fields)?;
    Ok(Reply::value(ctx.document.text_content(ptr)?))
}

fn set_text_content(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrValueArgs { ptr, value } = args("Element.setTextContent", fields)?;
    ctx.document.set_text_content(ptr, &value)?;
    Ok(Reply::value(ctx.document.text_content(ptr)?))
}

fn get_inner_html(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrArgs { ptr } = args("Element.getInnerHTML", fields)?;
    Ok(Reply::value(ctx.document.inner_html(ptr)?))
}

fn set_inner_html(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrValueArgs { ptr, value } = args("Element.setInnerHTML", fields)?;
    ctx.document.set_inner_html(ptr, &value)?;
    Ok(Reply::ack())
}

fn get_content_document(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrArgs { ptr } = args("Element.getContentDocument", fields)?;
    Ok(Reply::ptr(Some(ctx.document.content_document(ptr)?)))
}

fn document_open(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrArgs { ptr } = args("Document.open", fields)?;
    ctx.document.open(ptr)?;
    Ok(Reply::ack())
}

fn document_write(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrValueArgs { ptr, value } = args("Document.write", fields)?;
    ctx.document.write(ptr, &value)?;
    Ok(Reply::ack())
}

fn document_close(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let PtrArgs { ptr } = args("Document.close", fields)?;
    ctx.document.close(ptr)?;
    Ok(Reply::ack())
}

fn get_href(ctx: &CallContext, _fields: Fields) -> BridgeResult<Reply> {
    Ok(Reply::value(ctx.manager.ui().current_url()))
}

fn set_href(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let ValueArgs { value } = args("location.setHref", fields)?;
    let href = ctx.document.resolve_url(&value)?;
    ctx.manager.ui().navigate(href.as_str());
    Ok(Reply::ack())
}

fn alert(ctx: &CallContext, fields: Fields) -> BridgeResult<Reply> {
    let AlertArgs { msg } = args("alert", fields)?;
    ctx.manager.ui().alert(&msg);
    Ok(Reply::ack())
}

fn parent(ctx: CallContext, fields: Fields, responder: Responder) {
    let ParentArgs { prop, args: call_args } = match args("parent", fields) {
        Ok(parsed) => parsed,
        Err(err) => return responder.complete(Err(err)),
    };
    tokio::task::spawn_local(async move {
        let result = delegation::delegate_to_parent(&ctx, &prop, &call_args).await;
        responder.complete(result);
    });
}
