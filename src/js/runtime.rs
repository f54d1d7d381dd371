use anyhow::{anyhow, Context as _, Result};
use rquickjs::{Context, Ctx, Error as JsError, FromJs, Function, Runtime, Value};

/// Upper bound on promise jobs drained after a single evaluation.
const JOB_BUDGET: usize = 1000;

/// QuickJS runtime hosting one sandbox document.
///
/// `console.*` calls made by sandbox code are routed into `tracing` under the
/// `quickjs` target. Every evaluation drains the promise job queue before it
/// returns, so settled promises are observable by the next call.
pub struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
}

impl QuickJsEngine {
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().context("creating QuickJS runtime")?;
        let context = Context::full(&runtime).context("creating QuickJS context")?;
        let engine = Self { runtime, context };
        engine.install_console()?;
        Ok(engine)
    }

    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.eval_with::<()>(source, filename)
    }

    /// Evaluate `source`, converting its completion value into `V`.
    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> FromJs<'js>,
    {
        let script = tagged_source(source, filename);
        let value = self.context.with(|ctx| match ctx.eval::<V, _>(script) {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => Err(anyhow!(describe_exception(&ctx))),
            Err(err) => Err(anyhow::Error::from(err)),
        })?;
        self.drain_jobs();
        Ok(value)
    }

    /// Evaluate an expression once and return it as JSON. `undefined` maps to null.
    pub fn eval_json(&self, expression: &str, filename: &str) -> Result<serde_json::Value> {
        let source = format!(
            "(function (value) {{ return JSON.stringify(value === undefined ? null : value); }})({expression})"
        );
        let text: String = self.eval_with(&source, filename)?;
        serde_json::from_str(&text).context("expression did not produce JSON")
    }

    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.context.with(f).map_err(anyhow::Error::from)
    }

    /// Run queued promise jobs, returning how many ran.
    fn drain_jobs(&self) -> usize {
        let mut ran = 0;
        while self.runtime.is_job_pending() {
            if ran == JOB_BUDGET {
                tracing::warn!(target: "quickjs", budget = JOB_BUDGET, "job budget exhausted");
                break;
            }
            match self.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(err) => {
                    tracing::error!(target: "quickjs", error = ?err, "promise job failed");
                    break;
                }
            }
        }
        if ran > 0 {
            tracing::trace!(target: "quickjs", jobs = ran, "drained promise jobs");
        }
        ran
    }

    fn install_console(&self) -> Result<()> {
        self.with_context(|ctx| {
            let sink = Function::new(ctx.clone(), console_sink)?.with_name("__outframe_log")?;
            ctx.globals().set("__outframe_log", sink)?;
            ctx.eval::<(), _>(CONSOLE_SHIM)
        })
    }
}

fn console_sink(level: String, message: String) -> rquickjs::Result<()> {
    match level.as_str() {
        "error" => tracing::error!(target: "quickjs", "{message}"),
        "warn" => tracing::warn!(target: "quickjs", "{message}"),
        "debug" => tracing::debug!(target: "quickjs", "{message}"),
        _ => tracing::info!(target: "quickjs", "{message}"),
    }
    Ok(())
}

/// Render the pending exception as `message` or `message\nstack`.
fn describe_exception(ctx: &Ctx<'_>) -> String {
    let thrown: Value = ctx.catch();
    let Some(object) = thrown.as_object() else {
        return thrown
            .as_string()
            .and_then(|s| s.to_string().ok())
            .unwrap_or_else(|| format!("{thrown:?}"));
    };
    let message = object
        .get::<_, String>("message")
        .unwrap_or_else(|_| "uncaught exception".to_string());
    match object.get::<_, String>("stack") {
        Ok(stack) if !stack.is_empty() => format!("{message}\n{stack}"),
        _ => message,
    }
}

fn tagged_source(source: &str, filename: &str) -> String {
    let separator = if source.ends_with('\n') { "" } else { "\n" };
    format!("{source}{separator}//# sourceURL={filename}\n")
}

const CONSOLE_SHIM: &str = r#"
(function () {
  function show(value) {
    if (typeof value === 'string') return value;
    if (value === undefined) return 'undefined';
    try {
      return typeof value === 'object' ? JSON.stringify(value) : String(value);
    } catch (_) {
      return '[unprintable]';
    }
  }
  function level(name) {
    return function () {
      var parts = Array.prototype.map.call(arguments, show);
      try { __outframe_log(name, parts.join(' ')); } catch (_) {}
    };
  }
  var target = typeof console === 'object' && console !== null ? console : {};
  target.log = level('info');
  target.info = level('info');
  target.debug = level('debug');
  target.warn = level('warn');
  target.error = level('error');
  globalThis.console = target;
})();
"#;
