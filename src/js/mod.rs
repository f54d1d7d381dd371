//! Headless QuickJS host for the sandbox document.

pub mod processor;
pub mod runtime;
pub mod shim;
pub mod surface;

pub use runtime::QuickJsEngine;
pub use surface::HeadlessSurface;
