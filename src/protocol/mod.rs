//! Typed messages exchanged across the sandbox boundary.
//!
//! Two closed catalogs exist: [`HostMessage`] travels from the host into the
//! sandboxed document, [`SandboxMessage`] travels back out. On the wire every
//! message is `{ "type": <snake_case tag>, "payload"?: <object> }` with
//! camelCase payload fields. Inbound data is only ever interpreted after its
//! tag has been found in [`SandboxMessageKind::ALL`]; anything else is dropped.

pub mod buffers;

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Declares a catalog enum whose `ALL` list and wire tags come from the same
/// variant table, so a kind cannot exist outside its catalog.
macro_rules! message_kinds {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $tag:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: [Self; [$(stringify!($variant)),+].len()] = [$(Self::$variant),+];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $tag,)+
                }
            }
        }
    };
}

/// Key-value state of one widget model.
pub type WidgetState = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Host -> sandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalPayload {
    pub code: String,
    /// Echoed back on the matching `eval_result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPayload {
    pub mime_type: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append: Option<bool>,
}

impl RenderPayload {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
            metadata: None,
            append: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Append below existing output instead of replacing it.
    pub fn appending(mut self) -> Self {
        self.append = Some(true);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetStatePayload {
    pub comm_id: String,
    pub state: WidgetState,
    #[serde(default, with = "buffers", skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemePayload {
    pub is_dark: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub css_variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommMethod {
    /// A state patch for the model.
    Update,
    /// An application-level event with no persisted state.
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommOpenPayload {
    pub comm_id: String,
    pub target_name: String,
    pub state: WidgetState,
    #[serde(default, with = "buffers", skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommMsgPayload {
    pub comm_id: String,
    pub method: CommMethod,
    pub data: Value,
    #[serde(default, with = "buffers", skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommClosePayload {
    pub comm_id: String,
}

/// One model inside a batched `comm_sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedModel {
    pub comm_id: String,
    pub target_name: String,
    pub state: WidgetState,
    #[serde(default, with = "buffers", skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommSyncPayload {
    pub models: Vec<SyncedModel>,
}

/// Messages the host may post into the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HostMessage {
    Eval(EvalPayload),
    Render(RenderPayload),
    WidgetState(WidgetStatePayload),
    Theme(ThemePayload),
    Ping(PingPayload),
    Clear,
    BridgeReady,
    CommOpen(CommOpenPayload),
    CommMsg(CommMsgPayload),
    CommClose(CommClosePayload),
    CommSync(CommSyncPayload),
}

impl HostMessage {
    pub fn eval(code: impl Into<String>) -> Self {
        Self::Eval(EvalPayload {
            code: code.into(),
            id: None,
        })
    }

    /// An `eval` whose result carries `id`.
    pub fn tagged_eval(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Eval(EvalPayload {
            code: code.into(),
            id: Some(id.into()),
        })
    }

    pub fn kind(&self) -> HostMessageKind {
        match self {
            Self::Eval(_) => HostMessageKind::Eval,
            Self::Render(_) => HostMessageKind::Render,
            Self::WidgetState(_) => HostMessageKind::WidgetState,
            Self::Theme(_) => HostMessageKind::Theme,
            Self::Ping(_) => HostMessageKind::Ping,
            Self::Clear => HostMessageKind::Clear,
            Self::BridgeReady => HostMessageKind::BridgeReady,
            Self::CommOpen(_) => HostMessageKind::CommOpen,
            Self::CommMsg(_) => HostMessageKind::CommMsg,
            Self::CommClose(_) => HostMessageKind::CommClose,
            Self::CommSync(_) => HostMessageKind::CommSync,
        }
    }

    /// Wire form of the message.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

message_kinds! {
    pub enum HostMessageKind {
        Eval => "eval",
        Render => "render",
        WidgetState => "widget_state",
        Theme => "theme",
        Ping => "ping",
        Clear => "clear",
        BridgeReady => "bridge_ready",
        CommOpen => "comm_open",
        CommMsg => "comm_msg",
        CommClose => "comm_close",
        CommSync => "comm_sync",
    }
}

impl fmt::Display for HostMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Sandbox -> host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub received_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvalResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RenderCompletePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizePayload {
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkClickPayload {
    pub url: String,
    #[serde(default)]
    pub new_tab: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetUpdatePayload {
    pub comm_id: String,
    pub state: WidgetState,
    #[serde(default, with = "buffers", skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetCommMsgPayload {
    pub comm_id: String,
    pub method: CommMethod,
    #[serde(default)]
    pub data: Value,
    #[serde(default, with = "buffers", skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetCommClosePayload {
    pub comm_id: String,
}

/// Messages the sandbox may post to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SandboxMessage {
    Ready,
    RendererReady,
    Pong(PongPayload),
    EvalResult(EvalResultPayload),
    RenderComplete(RenderCompletePayload),
    Resize(ResizePayload),
    LinkClick(LinkClickPayload),
    WidgetUpdate(WidgetUpdatePayload),
    Error(ErrorPayload),
    WidgetReady,
    WidgetCommMsg(WidgetCommMsgPayload),
    WidgetCommClose(WidgetCommClosePayload),
}

impl SandboxMessage {
    /// Validate and decode an inbound wire message.
    ///
    /// Catalog membership is checked before the payload is looked at, so an
    /// unknown tag never reaches a payload decoder.
    pub fn parse(value: &Value) -> Result<Self, ProtocolError> {
        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        let kind = SandboxMessageKind::from_wire(tag)
            .ok_or_else(|| ProtocolError::UnknownType(tag.to_string()))?;

        let payload = match object.get("payload") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(payload) => payload.clone(),
        };

        let message = match kind {
            SandboxMessageKind::Ready => Self::Ready,
            SandboxMessageKind::RendererReady => Self::RendererReady,
            SandboxMessageKind::WidgetReady => Self::WidgetReady,
            SandboxMessageKind::Pong => Self::Pong(decode(kind, payload)?),
            SandboxMessageKind::EvalResult => Self::EvalResult(decode(kind, payload)?),
            SandboxMessageKind::RenderComplete => Self::RenderComplete(decode(kind, payload)?),
            SandboxMessageKind::Resize => Self::Resize(decode(kind, payload)?),
            SandboxMessageKind::LinkClick => Self::LinkClick(decode(kind, payload)?),
            SandboxMessageKind::WidgetUpdate => Self::WidgetUpdate(decode(kind, payload)?),
            SandboxMessageKind::Error => Self::Error(decode(kind, payload)?),
            SandboxMessageKind::WidgetCommMsg => Self::WidgetCommMsg(decode(kind, payload)?),
            SandboxMessageKind::WidgetCommClose => Self::WidgetCommClose(decode(kind, payload)?),
        };
        Ok(message)
    }

    pub fn kind(&self) -> SandboxMessageKind {
        match self {
            Self::Ready => SandboxMessageKind::Ready,
            Self::RendererReady => SandboxMessageKind::RendererReady,
            Self::Pong(_) => SandboxMessageKind::Pong,
            Self::EvalResult(_) => SandboxMessageKind::EvalResult,
            Self::RenderComplete(_) => SandboxMessageKind::RenderComplete,
            Self::Resize(_) => SandboxMessageKind::Resize,
            Self::LinkClick(_) => SandboxMessageKind::LinkClick,
            Self::WidgetUpdate(_) => SandboxMessageKind::WidgetUpdate,
            Self::Error(_) => SandboxMessageKind::Error,
            Self::WidgetReady => SandboxMessageKind::WidgetReady,
            Self::WidgetCommMsg(_) => SandboxMessageKind::WidgetCommMsg,
            Self::WidgetCommClose(_) => SandboxMessageKind::WidgetCommClose,
        }
    }
}

fn decode<T: DeserializeOwned>(kind: SandboxMessageKind, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|err| ProtocolError::MalformedPayload {
        kind: kind.as_str(),
        reason: err.to_string(),
    })
}

message_kinds! {
    /// Discriminants of the sandbox -> host catalog. [`is_inbound_message`]
    /// accepts exactly the tags listed in `ALL`.
    pub enum SandboxMessageKind {
        Ready => "ready",
        RendererReady => "renderer_ready",
        Pong => "pong",
        EvalResult => "eval_result",
        RenderComplete => "render_complete",
        Resize => "resize",
        LinkClick => "link_click",
        WidgetUpdate => "widget_update",
        Error => "error",
        WidgetReady => "widget_ready",
        WidgetCommMsg => "widget_comm_msg",
        WidgetCommClose => "widget_comm_close",
    }
}

impl SandboxMessageKind {
    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for SandboxMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True iff `value` is an object whose string `type` is in the inbound catalog.
pub fn is_inbound_message(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|object| object.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|tag| SandboxMessageKind::from_wire(tag).is_some())
}
