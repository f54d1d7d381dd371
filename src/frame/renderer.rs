use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::protocol::HostMessage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RendererError {
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("renderer bundle digest mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("renderer install failed: {0}")]
    Install(String),
}

/// Code and styles for the richer in-sandbox renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererBundle {
    pub script: String,
    pub stylesheet: String,
}

/// Result ids of the two install evals, in delivery order.
pub const INSTALL_EVAL_IDS: [&str; 2] = ["outframe:renderer-stylesheet", "outframe:renderer-script"];

impl RendererBundle {
    /// The two tagged `eval` messages that install the bundle, stylesheet first.
    pub fn install_messages(&self) -> [HostMessage; 2] {
        let [stylesheet_id, script_id] = INSTALL_EVAL_IDS;
        [
            HostMessage::tagged_eval(stylesheet_id, stylesheet_installer(&self.stylesheet)),
            HostMessage::tagged_eval(script_id, self.script.clone()),
        ]
    }
}

fn stylesheet_installer(css: &str) -> String {
    let literal = Value::String(css.to_string()).to_string();
    format!(
        "(function () {{ var style = document.createElement('style'); \
style.setAttribute('data-outframe-renderer', ''); style.textContent = {literal}; \
document.head.appendChild(style); }})();"
    )
}

/// Where renderer bundles come from.
pub trait RendererSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<RendererBundle, RendererError>>;
}

/// Fetches the renderer script and stylesheet over HTTP.
pub struct HttpRendererSource {
    client: reqwest::Client,
    script_url: Url,
    stylesheet_url: Url,
    expected_sha256: Option<String>,
}

impl HttpRendererSource {
    pub fn new(script_url: Url, stylesheet_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            script_url,
            stylesheet_url,
            expected_sha256: None,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Pin the script to a hex-encoded SHA-256 digest.
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into());
        self
    }

    async fn fetch_text(&self, url: &Url) -> Result<String, RendererError> {
        debug!(target: "renderer", %url, "fetching");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| RendererError::Fetch {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RendererError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|err| RendererError::Fetch {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }

    async fn fetch_bundle(&self) -> Result<RendererBundle, RendererError> {
        let script = self.fetch_text(&self.script_url).await?;
        let stylesheet = self.fetch_text(&self.stylesheet_url).await?;

        if let Some(expected) = &self.expected_sha256 {
            let actual = hex::encode(Sha256::digest(script.as_bytes()));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(RendererError::Integrity {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(RendererBundle { script, stylesheet })
    }
}

impl RendererSource for HttpRendererSource {
    fn fetch(&self) -> BoxFuture<'_, Result<RendererBundle, RendererError>> {
        self.fetch_bundle().boxed()
    }
}

/// Holds the renderer bundle once it has been fetched.
///
/// Share one cache between frame controllers to fetch at most once per
/// process; a failed fetch leaves the cache empty so a later frame retries.
#[derive(Default)]
pub struct RendererCache {
    slot: Mutex<Option<Arc<RendererBundle>>>,
    fetches: AtomicUsize,
}

impl RendererCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch(
        &self,
        source: &dyn RendererSource,
    ) -> Result<Arc<RendererBundle>, RendererError> {
        let mut slot = self.slot.lock().await;
        if let Some(bundle) = slot.as_ref() {
            debug!(target: "renderer", "cache hit");
            return Ok(Arc::clone(bundle));
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let bundle = Arc::new(source.fetch().await?);
        info!(
            target: "renderer",
            script_bytes = bundle.script.len(),
            stylesheet_bytes = bundle.stylesheet.len(),
            "renderer bundle cached"
        );
        *slot = Some(Arc::clone(&bundle));
        Ok(bundle)
    }

    pub async fn is_cached(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    pub async fn clear(&self) {
        self.slot.lock().await.take();
    }

    /// Number of fetches attempted through this cache.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

/// Which renderer a frame ends up with.
#[derive(Clone, Default)]
pub enum RendererPlan {
    /// Accept the document's inline renderer as final.
    #[default]
    Inline,
    /// Fetch and inject a richer renderer after the document boots.
    Upgrade {
        cache: Arc<RendererCache>,
        source: Arc<dyn RendererSource>,
    },
}

impl RendererPlan {
    pub fn upgrade(cache: Arc<RendererCache>, source: Arc<dyn RendererSource>) -> Self {
        Self::Upgrade { cache, source }
    }
}

impl fmt::Debug for RendererPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => f.write_str("Inline"),
            Self::Upgrade { .. } => f.write_str("Upgrade"),
        }
    }
}
