#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use outframe::document::SandboxDocument;
use outframe::frame::renderer::{RendererBundle, RendererError, RendererSource};
use outframe::frame::surface::{DocumentHandle, InboundEvent, OutputSurface, SourceId, SurfaceError};
use outframe::protocol::{HostMessage, SandboxMessage, WidgetState};
use serde_json::Value;

#[derive(Debug, Default)]
pub struct SurfaceLog {
    pub loaded: Vec<(DocumentHandle, &'static str)>,
    pub posted: Vec<HostMessage>,
    pub released: Vec<DocumentHandle>,
}

/// Records everything the controller does to its surface.
pub struct RecordingSurface {
    source: SourceId,
    log: Rc<RefCell<SurfaceLog>>,
    loaded: bool,
}

impl RecordingSurface {
    pub fn new() -> (Self, Rc<RefCell<SurfaceLog>>) {
        let log = Rc::new(RefCell::new(SurfaceLog::default()));
        (
            Self {
                source: SourceId::next(),
                log: Rc::clone(&log),
                loaded: false,
            },
            log,
        )
    }
}

impl OutputSurface for RecordingSurface {
    fn source(&self) -> SourceId {
        self.source
    }

    fn load(&mut self, document: &SandboxDocument) -> Result<DocumentHandle, SurfaceError> {
        let handle = DocumentHandle::new("blob:test/");
        self.log
            .borrow_mut()
            .loaded
            .push((handle.clone(), document.sandbox_attributes()));
        self.loaded = true;
        Ok(handle)
    }

    fn post(&mut self, message: &HostMessage) -> Result<(), SurfaceError> {
        if !self.loaded {
            return Err(SurfaceError::NotLoaded);
        }
        self.log.borrow_mut().posted.push(message.clone());
        Ok(())
    }

    fn release(&mut self, handle: DocumentHandle) {
        self.loaded = false;
        self.log.borrow_mut().released.push(handle);
    }
}

pub fn inbound(source: SourceId, message: SandboxMessage) -> InboundEvent {
    InboundEvent::new(source, serde_json::to_value(message).unwrap())
}

pub fn object(value: Value) -> WidgetState {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// In-memory renderer bundle source.
pub struct StaticSource {
    pub bundle: RendererBundle,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl StaticSource {
    pub fn new(script: &str) -> Self {
        Self {
            bundle: RendererBundle {
                script: script.to_string(),
                stylesheet: ".outframe-widget { display: block; }".to_string(),
            },
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn failing() -> Self {
        let source = Self::new("");
        source.fail.store(true, Ordering::SeqCst);
        source
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RendererSource for StaticSource {
    fn fetch(&self) -> BoxFuture<'_, Result<RendererBundle, RendererError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail.load(Ordering::SeqCst) {
            Err(RendererError::Fetch {
                url: "memory://renderer.js".into(),
                reason: "offline".into(),
            })
        } else {
            Ok(self.bundle.clone())
        };
        async move { result }.boxed()
    }
}
