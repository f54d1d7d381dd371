use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use outframe::document::{DocumentOptions, CONTENT_SECURITY_POLICY, SANDBOX_ATTRIBUTES};
use outframe::frame::renderer::RendererCache;
use outframe::js::surface::pump;
use outframe::protocol::RenderPayload;
use outframe::{FrameController, HeadlessSurface, OutframeConfig, SandboxDocument, Theme};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: outframe [document [--dark] | policy | probe [text]]";

fn main() -> Result<()> {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let mut args = env::args().skip(1);
    let command = args.next().unwrap_or_else(|| String::from("probe"));
    let rest: Vec<String> = args.collect();

    let config = OutframeConfig::load(OutframeConfig::default_path()).unwrap_or_else(|err| {
        eprintln!("Failed to load configuration: {err}. Using defaults.");
        OutframeConfig::default()
    });

    match command.as_str() {
        "document" => {
            let theme = if rest.iter().any(|arg| arg == "--dark") {
                Theme {
                    dark: true,
                    ..config.theme
                }
            } else {
                config.theme
            };
            let document = SandboxDocument::generate(&DocumentOptions {
                theme,
                ..DocumentOptions::default()
            });
            print!("{}", document.html());
            Ok(())
        }
        "policy" => {
            println!("sandbox: {SANDBOX_ATTRIBUTES}");
            println!("content-security-policy: {CONTENT_SECURITY_POLICY}");
            Ok(())
        }
        "probe" => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            runtime.block_on(probe(config, rest.into_iter().next()))
        }
        "-h" | "--help" | "help" => {
            println!("{USAGE}");
            Ok(())
        }
        other => {
            eprintln!("{USAGE}");
            bail!("unknown command: {other}")
        }
    }
}

/// Mount one headless frame, render some text, and report what came back.
async fn probe(config: OutframeConfig, text: Option<String>) -> Result<()> {
    let cache = Arc::new(RendererCache::new());
    let mut frame = FrameController::new(HeadlessSurface::new(), config.frame.clone())
        .with_renderer(config.renderer_plan(cache))
        .with_theme(config.theme.clone());

    frame.mount()?;
    let text = text.unwrap_or_else(|| String::from("hello from outframe"));
    frame.render(RenderPayload::new("text/plain", text))?;
    frame.ping(Some(now_millis()))?;

    for event in pump(&mut frame).await? {
        println!("{event:?}");
    }
    if !frame.is_ready() {
        bail!("sandbox never became ready (state {:?})", frame.state());
    }

    println!("state: {:?}", frame.state());
    println!("root: {}", frame.surface().root_text()?);
    frame.teardown();
    Ok(())
}

fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}
