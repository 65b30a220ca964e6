//! Messages exchanged between the host and a sandbox.
//!
//! Host to sandbox traffic goes through the shared channel buffers as
//! compact JSON text; sandbox to host traffic is posted asynchronously.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::dom::Handle;

/// Lifecycle notifications a sandbox posts to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Ready,
    Wait,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Completion value of the evaluated script (`done` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    /// Uncaught exception message (`done` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            value: None,
            error: None,
        }
    }

    pub fn done(outcome: Result<Option<JsonValue>, String>) -> Self {
        match outcome {
            Ok(value) => Self {
                kind: EventKind::Done,
                value,
                error: None,
            },
            Err(error) => Self {
                kind: EventKind::Done,
                value: None,
                error: Some(error),
            },
        }
    }
}

/// A remote call from sandbox script into the host dispatch table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    #[serde(rename = "f")]
    pub operation: String,
    #[serde(flatten)]
    pub fields: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SandboxMessage {
    Event(Event),
    Call(Call),
    /// Anything else; answered with an empty acknowledgement.
    Other(JsonValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Eval { js: String },
}

/// Answer to a call or lifecycle event. The empty reply `{}` is the plain
/// acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ptr: Option<Handle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ack() -> Self {
        Self::default()
    }

    pub fn value(value: impl Into<JsonValue>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn ptr(ptr: Option<Handle>) -> Self {
        Self {
            ptr,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostMessage {
    Command(Command),
    Reply(Reply),
}

impl HostMessage {
    pub fn eval(js: impl Into<String>) -> Self {
        Self::Command(Command::Eval { js: js.into() })
    }
}

impl From<Reply> for HostMessage {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_fields_are_flattened() {
        let message: SandboxMessage =
            serde_json::from_value(json!({ "f": "Element.getTextContent", "ptr": 7 })).unwrap();
        let SandboxMessage::Call(call) = message else {
            panic!("expected call, got {message:?}");
        };
        assert_eq!(call.operation, "Element.getTextContent");
        assert_eq!(call.fields.get("ptr"), Some(&json!(7)));
    }

    #[test]
    fn lifecycle_events_parse() {
        let message: SandboxMessage = serde_json::from_value(json!({ "type": "wait" })).unwrap();
        assert_eq!(message, SandboxMessage::Event(Event::new(EventKind::Wait)));
    }

    #[test]
    fn empty_reply_is_empty_object() {
        assert_eq!(serde_json::to_string(&HostMessage::from(Reply::ack())).unwrap(), "{}");
        assert_eq!(
            serde_json::to_string(&Reply::ptr(Some(Handle(3)))).unwrap(),
            r#"{"ptr":3}"#
        );
    }

    #[test]
    fn eval_command_is_tagged() {
        let text = serde_json::to_string(&HostMessage::eval("1 + 1")).unwrap();
        assert_eq!(text, r#"{"type":"eval","js":"1 + 1"}"#);
        let decoded: HostMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, HostMessage::eval("1 + 1"));
        let reply: HostMessage = serde_json::from_str(r#"{"value":"x"}"#).unwrap();
        assert_eq!(reply, HostMessage::Reply(Reply::value("x")));
    }
}
