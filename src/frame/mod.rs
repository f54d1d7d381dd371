//! Owns one sandboxed output surface end to end.
//!
//! The controller loads the generated document, tracks the two-stage
//! readiness handshake, queues outbound messages until the renderer is
//! ready, and turns validated inbound messages into [`FrameEvent`]s.

pub mod renderer;
pub mod surface;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::document::{DocumentOptions, SandboxDocument, Theme};
use crate::protocol::{
    CommMethod, EvalResultPayload, HostMessage, PingPayload, PongPayload, RenderPayload,
    SandboxMessage, ThemePayload, WidgetCommMsgPayload, WidgetState,
};

use self::renderer::{RendererBundle, RendererError, RendererPlan};
use self::surface::{DocumentHandle, InboundEvent, OutputSurface, SurfaceError};

/// Lifecycle of one frame. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// No document assigned yet.
    Unloaded,
    /// Document assigned, `ready` not yet received.
    Loading,
    /// The document's inline handler is running.
    BootstrapReady,
    /// Full renderer available.
    RendererReady,
    /// Renderer upgrade failed; the inline renderer is final.
    RendererFallback,
}

impl FrameState {
    pub fn is_bootstrap_ready(self) -> bool {
        matches!(
            self,
            Self::BootstrapReady | Self::RendererReady | Self::RendererFallback
        )
    }

    pub fn is_renderer_ready(self) -> bool {
        matches!(self, Self::RendererReady | Self::RendererFallback)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameConfig {
    pub min_height: u32,
    pub max_height: u32,
    /// Maximum number of messages held before the renderer is ready.
    pub queue_capacity: usize,
    pub ready_timeout: Duration,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            min_height: 24,
            max_height: 2000,
            queue_capacity: 1024,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

impl FrameConfig {
    /// Clamp a height reported by the sandbox into `[min_height, max_height]`.
    pub fn clamp_height(&self, reported: f64) -> u32 {
        let low = self.min_height.min(self.max_height);
        let high = self.min_height.max(self.max_height);
        if !reported.is_finite() {
            return low;
        }
        reported.ceil().clamp(f64::from(low), f64::from(high)) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("sandbox error: {message}")]
    Sandbox {
        message: String,
        stack: Option<String>,
    },
    #[error("renderer unavailable, continuing with inline renderer: {0}")]
    RendererUnavailable(#[from] RendererError),
    #[error("pending queue is full ({capacity} messages)")]
    QueueFull { capacity: usize },
    #[error("sandbox not ready after {0:?}")]
    ReadyTimeout(Duration),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// Widget traffic from the sandbox, handed to the comm bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetEvent {
    Ready,
    Update {
        comm_id: String,
        state: WidgetState,
        buffers: Vec<Vec<u8>>,
    },
    Custom {
        comm_id: String,
        data: Value,
        buffers: Vec<Vec<u8>>,
    },
    Close {
        comm_id: String,
    },
}

/// Validated inbound events surfaced to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    BootstrapReady,
    RendererReady { fallback: bool },
    Resized { height: u32, width: Option<u32> },
    RenderComplete { height: Option<u32> },
    LinkClicked { url: String, new_tab: bool },
    EvalResult(EvalResultPayload),
    Pong(PongPayload),
    Error(FrameError),
    Widget(WidgetEvent),
}

pub struct FrameController<S: OutputSurface> {
    surface: S,
    config: FrameConfig,
    plan: RendererPlan,
    theme: Theme,
    state: FrameState,
    handle: Option<DocumentHandle>,
    queue: VecDeque<HostMessage>,
    awaiting_renderer: bool,
    /// Ids of install evals whose results have not arrived.
    install_pending: Vec<String>,
    mounted_at: Option<Instant>,
    stalled: bool,
}

impl<S: OutputSurface> FrameController<S> {
    pub fn new(surface: S, config: FrameConfig) -> Self {
        Self {
            surface,
            config,
            plan: RendererPlan::Inline,
            theme: Theme::default(),
            state: FrameState::Unloaded,
            handle: None,
            queue: VecDeque::new(),
            awaiting_renderer: false,
            install_pending: Vec::new(),
            mounted_at: None,
            stalled: false,
        }
    }

    pub fn with_renderer(mut self, plan: RendererPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_theme(mut self, theme: Theme) -> Self {
        self.theme = theme;
        self
    }

    /// Generate the sandbox document and load it into the surface.
    pub fn mount(&mut self) -> Result<(), FrameError> {
        if self.handle.is_some() {
            debug!(target: "frame", "document already mounted");
            return Ok(());
        }

        let document = SandboxDocument::generate(&DocumentOptions {
            theme: self.theme.clone(),
            ..DocumentOptions::default()
        });
        let handle = self.surface.load(&document)?;
        info!(
            target: "frame",
            source = %self.surface.source(),
            url = handle.url(),
            "sandbox document loaded"
        );
        self.handle = Some(handle);
        self.state = FrameState::Loading;
        self.mounted_at = Some(Instant::now());
        Ok(())
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Full renderer available.
    pub fn is_ready(&self) -> bool {
        self.state.is_renderer_ready()
    }

    /// Some code is running inside the surface.
    pub fn is_iframe_ready(&self) -> bool {
        self.state.is_bootstrap_ready()
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn document_handle(&self) -> Option<&DocumentHandle> {
        self.handle.as_ref()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// Deliver now if the renderer is ready, otherwise queue.
    pub fn send(&mut self, message: HostMessage) -> Result<(), FrameError> {
        if self.state.is_renderer_ready() {
            return self.deliver(&message);
        }

        if self.queue.len() >= self.config.queue_capacity {
            warn!(
                target: "frame",
                kind = %message.kind(),
                capacity = self.config.queue_capacity,
                "pending queue full, rejecting message"
            );
            return Err(FrameError::QueueFull {
                capacity: self.config.queue_capacity,
            });
        }

        trace!(target: "frame", kind = %message.kind(), "queued until renderer ready");
        self.queue.push_back(message);
        Ok(())
    }

    pub fn render(&mut self, payload: RenderPayload) -> Result<(), FrameError> {
        self.send(HostMessage::Render(payload))
    }

    pub fn eval(&mut self, code: impl Into<String>) -> Result<(), FrameError> {
        self.send(HostMessage::eval(code))
    }

    pub fn clear(&mut self) -> Result<(), FrameError> {
        self.send(HostMessage::Clear)
    }

    pub fn ping(&mut self, sent_at: Option<f64>) -> Result<(), FrameError> {
        self.send(HostMessage::Ping(PingPayload { sent_at }))
    }

    /// Forward a theme change. The document is mutated in place, never
    /// reloaded, so rendered content and widget state survive.
    pub fn set_theme(&mut self, is_dark: bool) -> Result<(), FrameError> {
        self.theme.dark = is_dark;
        if self.state == FrameState::Unloaded {
            return Ok(());
        }
        self.send(HostMessage::Theme(ThemePayload {
            is_dark,
            css_variables: self.theme.css_variables.clone(),
        }))
    }

    /// Validate an inbound event and dispatch it.
    ///
    /// Events from any window other than this frame's surface are dropped
    /// before their payload is looked at.
    pub async fn handle_event(&mut self, event: InboundEvent) -> Vec<FrameEvent> {
        if event.source != self.surface.source() {
            trace!(
                target: "frame",
                expected = %self.surface.source(),
                actual = %event.source,
                "ignoring message from foreign window"
            );
            return Vec::new();
        }

        match SandboxMessage::parse(&event.data) {
            Ok(message) => self.dispatch(message).await,
            Err(err) => {
                debug!(target: "protocol", error = %err, "dropping inbound message");
                Vec::new()
            }
        }
    }

    /// Report a stalled handshake once `ready_timeout` has elapsed since
    /// mounting. The queued messages are discarded.
    pub fn check_ready_timeout(&mut self, now: Instant) -> Option<FrameEvent> {
        if self.state.is_renderer_ready() || self.stalled {
            return None;
        }
        let mounted_at = self.mounted_at?;
        let waited = now.saturating_duration_since(mounted_at);
        if waited < self.config.ready_timeout {
            return None;
        }

        self.stalled = true;
        let dropped = self.queue.len();
        self.queue.clear();
        warn!(target: "frame", ?waited, dropped, state = ?self.state, "sandbox did not become ready");
        Some(FrameEvent::Error(FrameError::ReadyTimeout(
            self.config.ready_timeout,
        )))
    }

    /// Release the document and drop anything still queued.
    pub fn teardown(self) {
        drop(self);
    }

    async fn dispatch(&mut self, message: SandboxMessage) -> Vec<FrameEvent> {
        match message {
            SandboxMessage::Ready => self.on_bootstrap_ready().await,
            SandboxMessage::RendererReady => self.on_renderer_ready(),
            SandboxMessage::EvalResult(result) => self.on_eval_result(result),
            SandboxMessage::Pong(pong) => vec![FrameEvent::Pong(pong)],
            SandboxMessage::RenderComplete(complete) => vec![FrameEvent::RenderComplete {
                height: complete.height.map(|height| self.config.clamp_height(height)),
            }],
            SandboxMessage::Resize(resize) => vec![FrameEvent::Resized {
                height: self.config.clamp_height(resize.height),
                width: resize
                    .width
                    .filter(|width| width.is_finite() && *width >= 0.0)
                    .map(|width| width.ceil() as u32),
            }],
            SandboxMessage::LinkClick(click) => vec![FrameEvent::LinkClicked {
                url: click.url,
                new_tab: click.new_tab,
            }],
            SandboxMessage::Error(err) => {
                warn!(target: "frame", message = %err.message, "sandbox reported an error");
                vec![FrameEvent::Error(FrameError::Sandbox {
                    message: err.message,
                    stack: err.stack,
                })]
            }
            SandboxMessage::WidgetReady => vec![FrameEvent::Widget(WidgetEvent::Ready)],
            SandboxMessage::WidgetUpdate(update) => {
                vec![FrameEvent::Widget(WidgetEvent::Update {
                    comm_id: update.comm_id,
                    state: update.state,
                    buffers: update.buffers,
                })]
            }
            SandboxMessage::WidgetCommMsg(msg) => widget_comm_msg(msg),
            SandboxMessage::WidgetCommClose(close) => {
                vec![FrameEvent::Widget(WidgetEvent::Close {
                    comm_id: close.comm_id,
                })]
            }
        }
    }

    async fn on_bootstrap_ready(&mut self) -> Vec<FrameEvent> {
        if self.state.is_bootstrap_ready() {
            debug!(target: "frame", "duplicate ready ignored");
            return Vec::new();
        }

        self.state = FrameState::BootstrapReady;
        info!(target: "frame", source = %self.surface.source(), "sandbox bootstrap ready");
        let mut events = vec![FrameEvent::BootstrapReady];

        let (cache, source) = match &self.plan {
            RendererPlan::Inline => {
                events.extend(self.enter_renderer_ready(FrameState::RendererReady));
                return events;
            }
            RendererPlan::Upgrade { cache, source } => (Arc::clone(cache), Arc::clone(source)),
        };

        match cache.get_or_fetch(source.as_ref()).await {
            Ok(bundle) => {
                if let Err(err) = self.install(&bundle) {
                    events.extend(self.fall_back(RendererError::Install(err.to_string())));
                }
            }
            Err(err) => events.extend(self.fall_back(err)),
        }
        events
    }

    fn install(&mut self, bundle: &RendererBundle) -> Result<(), FrameError> {
        self.awaiting_renderer = true;
        for message in bundle.install_messages() {
            self.deliver(&message)?;
            if let HostMessage::Eval(eval) = &message {
                self.install_pending.extend(eval.id.clone());
            }
        }
        debug!(target: "frame", "renderer bundle injected, awaiting renderer_ready");
        Ok(())
    }

    fn on_renderer_ready(&mut self) -> Vec<FrameEvent> {
        if self.state != FrameState::BootstrapReady || !self.awaiting_renderer {
            debug!(target: "frame", state = ?self.state, "unexpected renderer_ready ignored");
            return Vec::new();
        }
        self.awaiting_renderer = false;
        self.enter_renderer_ready(FrameState::RendererReady)
    }

    /// Install results are matched by id; untagged results always surface.
    fn on_eval_result(&mut self, result: EvalResultPayload) -> Vec<FrameEvent> {
        let position = result
            .id
            .as_ref()
            .and_then(|id| self.install_pending.iter().position(|pending| pending == id));
        let Some(position) = position else {
            return vec![FrameEvent::EvalResult(result)];
        };

        self.install_pending.remove(position);
        if result.success {
            return Vec::new();
        }

        let reason = result
            .error
            .unwrap_or_else(|| String::from("renderer bundle threw"));
        if self.awaiting_renderer {
            self.install_pending.clear();
            return self.fall_back(RendererError::Install(reason));
        }
        warn!(target: "frame", %reason, "renderer install step failed after readiness");
        Vec::new()
    }

    fn fall_back(&mut self, err: RendererError) -> Vec<FrameEvent> {
        error!(
            target: "frame",
            error = %err,
            "renderer upgrade failed, falling back to inline renderer"
        );
        self.awaiting_renderer = false;
        let mut events = vec![FrameEvent::Error(FrameError::RendererUnavailable(err))];
        events.extend(self.enter_renderer_ready(FrameState::RendererFallback));
        events
    }

    fn enter_renderer_ready(&mut self, state: FrameState) -> Vec<FrameEvent> {
        self.state = state;
        let mut events = vec![FrameEvent::RendererReady {
            fallback: state == FrameState::RendererFallback,
        }];

        let pending = std::mem::take(&mut self.queue);
        if !pending.is_empty() {
            debug!(target: "frame", count = pending.len(), "flushing pending messages");
        }
        for message in pending {
            if let Err(err) = self.deliver(&message) {
                events.push(FrameEvent::Error(err));
            }
        }
        events
    }

    fn deliver(&mut self, message: &HostMessage) -> Result<(), FrameError> {
        trace!(target: "frame", kind = %message.kind(), "posting to sandbox");
        self.surface.post(message).map_err(|err| {
            error!(target: "frame", kind = %message.kind(), error = %err, "delivery failed");
            FrameError::from(err)
        })
    }
}

impl<S: OutputSurface> Drop for FrameController<S> {
    fn drop(&mut self) {
        let discarded = self.queue.len();
        self.queue.clear();
        if let Some(handle) = self.handle.take() {
            debug!(
                target: "frame",
                url = handle.url(),
                discarded,
                "releasing sandbox document"
            );
            self.surface.release(handle);
        }
    }
}

fn widget_comm_msg(msg: WidgetCommMsgPayload) -> Vec<FrameEvent> {
    let WidgetCommMsgPayload {
        comm_id,
        method,
        data,
        buffers,
    } = msg;
    match method {
        CommMethod::Update => match data {
            Value::Object(state) => vec![FrameEvent::Widget(WidgetEvent::Update {
                comm_id,
                state,
                buffers,
            })],
            _ => {
                debug!(target: "protocol", %comm_id, "update without object state dropped");
                Vec::new()
            }
        },
        CommMethod::Custom => vec![FrameEvent::Widget(WidgetEvent::Custom {
            comm_id,
            data,
            buffers,
        })],
    }
}
