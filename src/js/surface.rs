use serde_json::Value;
use tracing::{debug, info, trace};

use crate::document::{sandbox_tokens, SandboxDocument};
use crate::frame::surface::{DocumentHandle, InboundEvent, OutputSurface, SourceId, SurfaceError};
use crate::frame::{FrameController, FrameEvent};
use crate::protocol::HostMessage;

use super::processor::{collect_inline_scripts, inspect_document};
use super::runtime::QuickJsEngine;
use super::shim::{self, ShimConfig};

const DEFAULT_VIEWPORT_WIDTH: u32 = 800;

/// An [`OutputSurface`] that runs the sandbox document inside QuickJS.
///
/// Messages the document posts to its parent collect in an outbox; drain
/// them with [`HeadlessSurface::take_events`] and hand them to the frame
/// controller.
pub struct HeadlessSurface {
    source: SourceId,
    viewport_width: u32,
    engine: Option<QuickJsEngine>,
    handle: Option<DocumentHandle>,
    last_released: Option<DocumentHandle>,
    release_count: usize,
}

impl Default for HeadlessSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self {
            source: SourceId::next(),
            viewport_width: DEFAULT_VIEWPORT_WIDTH,
            engine: None,
            handle: None,
            last_released: None,
            release_count: 0,
        }
    }

    pub fn with_viewport_width(mut self, width: u32) -> Self {
        self.viewport_width = width;
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }

    pub fn last_released(&self) -> Option<&DocumentHandle> {
        self.last_released.as_ref()
    }

    /// Number of document handles released over the surface's lifetime.
    pub fn release_count(&self) -> usize {
        self.release_count
    }

    /// Run pending timers and resize observers, then drain everything the
    /// document has posted to its parent.
    pub fn take_events(&mut self) -> Result<Vec<InboundEvent>, SurfaceError> {
        let engine = self.engine()?;
        engine
            .eval("__outframe_settle()", "outframe-settle.js")
            .map_err(delivery)?;
        let posted = engine
            .eval_json("__outframe_outbox.splice(0)", "outframe-outbox.js")
            .map_err(delivery)?;
        let Value::Array(messages) = posted else {
            return Err(SurfaceError::Delivery("outbox is not an array".into()));
        };
        trace!(target: "quickjs", count = messages.len(), "drained outbox");
        Ok(messages
            .into_iter()
            .map(|data| InboundEvent::new(self.source, data))
            .collect())
    }

    /// Deliver a message that claims to come from some window other than
    /// the parent.
    pub fn inject_foreign(&mut self, message: &HostMessage) -> Result<(), SurfaceError> {
        self.deliver("foreign", message)
    }

    /// Click the first anchor whose `href` attribute equals `href`.
    pub fn click_link(&mut self, href: &str, new_tab: bool) -> Result<bool, SurfaceError> {
        let script = format!("__outframe_click({}, {new_tab})", js_string(href));
        self.engine()?
            .eval_with::<bool>(&script, "outframe-click.js")
            .map_err(delivery)
    }

    /// Run code inside the sandbox as if the document itself did.
    pub fn run_script(&mut self, code: &str) -> Result<(), SurfaceError> {
        self.engine()?
            .eval(code, "outframe-user.js")
            .map_err(delivery)
    }

    /// Evaluate an expression inside the sandbox and return it as JSON.
    pub fn query(&self, expression: &str) -> Result<Value, SurfaceError> {
        self.engine()?
            .eval_json(expression, "outframe-query.js")
            .map_err(delivery)
    }

    pub fn root_text(&self) -> Result<String, SurfaceError> {
        match self.query("document.getElementById('root').textContent")? {
            Value::String(text) => Ok(text),
            other => Ok(other.to_string()),
        }
    }

    pub fn root_html(&self) -> Result<String, SurfaceError> {
        match self.query("document.getElementById('root').innerHTML")? {
            Value::String(html) => Ok(html),
            other => Ok(other.to_string()),
        }
    }

    pub fn theme(&self) -> Result<Option<String>, SurfaceError> {
        Ok(self
            .query("document.documentElement.getAttribute('data-theme')")?
            .as_str()
            .map(str::to_string))
    }

    pub fn css_variable(&self, name: &str) -> Result<String, SurfaceError> {
        let expression = format!(
            "document.documentElement.style.getPropertyValue({})",
            js_string(name)
        );
        Ok(self.query(&expression)?.as_str().unwrap_or_default().to_string())
    }

    /// The sandbox's replica of a widget model, if it has one.
    pub fn model(&self, comm_id: &str) -> Result<Option<Value>, SurfaceError> {
        let expression = format!("window.outframe.model({})", js_string(comm_id));
        Ok(match self.query(&expression)? {
            Value::Null => None,
            model => Some(model),
        })
    }

    fn engine(&self) -> Result<&QuickJsEngine, SurfaceError> {
        self.engine.as_ref().ok_or(SurfaceError::NotLoaded)
    }

    fn deliver(&mut self, origin: &str, message: &HostMessage) -> Result<(), SurfaceError> {
        let data = message
            .to_value()
            .map_err(|err| SurfaceError::Delivery(err.to_string()))?;
        let script = format!("__outframe_deliver({}, {data})", js_string(origin));
        self.engine()?
            .eval(&script, "outframe-deliver.js")
            .map_err(delivery)
    }
}

impl OutputSurface for HeadlessSurface {
    fn source(&self) -> SourceId {
        self.source
    }

    fn load(&mut self, document: &SandboxDocument) -> Result<DocumentHandle, SurfaceError> {
        if sandbox_tokens().contains("allow-same-origin") {
            return Err(SurfaceError::Load(
                "refusing to load a document with same-origin access".into(),
            ));
        }

        let html = document.html();
        let summary = inspect_document(html).map_err(load)?;
        let scripts = collect_inline_scripts(html).map_err(load)?;

        let engine = QuickJsEngine::new().map_err(load)?;
        shim::install(
            &engine,
            &ShimConfig {
                theme: summary.theme,
                root_style: summary.root_style,
                title: None,
                viewport_width: self.viewport_width,
            },
        )
        .map_err(load)?;

        for (index, script) in scripts.iter().enumerate() {
            engine
                .eval(script, &format!("sandbox-inline-{index}.js"))
                .map_err(load)?;
        }

        let handle = DocumentHandle::new("blob:outframe/");
        info!(
            target: "quickjs",
            source = %self.source,
            url = handle.url(),
            sandbox = document.sandbox_attributes(),
            scripts = scripts.len(),
            "headless document loaded"
        );
        self.engine = Some(engine);
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn post(&mut self, message: &HostMessage) -> Result<(), SurfaceError> {
        trace!(target: "quickjs", kind = %message.kind(), "delivering to sandbox");
        self.deliver("parent", message)
    }

    fn release(&mut self, handle: DocumentHandle) {
        if self.handle.as_ref() == Some(&handle) {
            self.engine = None;
            self.handle = None;
        }
        debug!(target: "quickjs", url = handle.url(), "headless document released");
        self.release_count += 1;
        self.last_released = Some(handle);
    }
}

/// Feed everything the headless document has posted back into its
/// controller until the outbox stays empty.
pub async fn pump(
    frame: &mut FrameController<HeadlessSurface>,
) -> Result<Vec<FrameEvent>, SurfaceError> {
    let mut observed = Vec::new();
    loop {
        let inbound = frame.surface_mut().take_events()?;
        if inbound.is_empty() {
            return Ok(observed);
        }
        for event in inbound {
            observed.extend(frame.handle_event(event).await);
        }
    }
}

fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

fn load(err: anyhow::Error) -> SurfaceError {
    SurfaceError::Load(format!("{err:#}"))
}

fn delivery(err: anyhow::Error) -> SurfaceError {
    SurfaceError::Delivery(format!("{err:#}"))
}
