//! Isolated rendering of untrusted notebook outputs.
//!
//! Every output gets its own sandboxed surface loaded with a generated
//! document. The host talks to it only through the typed messages in
//! [`protocol`], driven by a [`FrameController`], and widget models are
//! mirrored into it by a [`CommBridge`].

pub mod comm;
pub mod config;
pub mod document;
pub mod frame;
pub mod js;
pub mod protocol;

pub use comm::store::{Provenance, SharedStore, WidgetStore};
pub use comm::CommBridge;
pub use config::OutframeConfig;
pub use document::{SandboxDocument, Theme};
pub use frame::{FrameController, FrameEvent, FrameState};
pub use js::HeadlessSurface;
pub use protocol::{is_inbound_message, HostMessage, SandboxMessage};
