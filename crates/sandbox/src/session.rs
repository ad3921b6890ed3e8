//! Execution Session
//!
//! One page, one worker, one shim. The session owns the sandbox, the
//! bridge and the change tracker; callers drive it with `exec`,
//! `track_changes`, `click` and friends.

use rquickjs::prelude::Coerced;
use rquickjs::Ctx;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;

use crate::bridge::{CallbackBridge, Fetcher, StyleProvider};
use crate::config::SessionConfig;
use crate::diagnostics::{self, strip_comment_markers};
use crate::error::{ExecError, SandboxError};
use crate::events::{mutation_channel, MutationRecorder};
use crate::sandbox::{EngineLimits, ScriptSandbox};
use crate::shim::{self, ShimSetup};
use crate::tracker::{ChangeTracker, Changes};
use crate::watchdog::{ExecEvent, TimeoutGuard};

const SERIALIZE_SCRIPT: &str =
    "document.documentElement ? document.documentElement.outerHTML : ''";
const CLOSE_SCRIPT: &str = "document.close()";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// A script to evaluate
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub script: String,
    /// Install the shim (and load the page) before evaluating
    pub is_bootstrap: bool,
}

impl ExecRequest {
    pub fn bootstrap(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            is_bootstrap: true,
        }
    }

    pub fn script(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            is_bootstrap: false,
        }
    }
}

/// Result of `click`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickOutcome {
    /// A listener or a form submission ran
    pub fired: bool,
    pub changes: Changes,
}

pub struct ExecutionSession {
    pub config: SessionConfig,
    html: String,
    lifecycle: Lifecycle,

    // Engine
    sandbox: ScriptSandbox,
    bootstrapped: bool,

    // Host capabilities
    fetcher: Arc<dyn Fetcher>,
    styles: Arc<dyn StyleProvider>,
    bridge: Option<Arc<CallbackBridge>>,

    // Change detection
    recorder: MutationRecorder,
    tracker: ChangeTracker,
    output_html: Option<String>,
}

impl ExecutionSession {
    pub fn new(
        config: SessionConfig,
        html: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        styles: Arc<dyn StyleProvider>,
    ) -> Self {
        let (recorder, queue) = mutation_channel(config.mutation_capacity);
        let tracker = ChangeTracker::new(queue, config.quiescence(), config.exec_timeout());
        let sandbox = ScriptSandbox::new(EngineLimits {
            memory_limit: config.memory_limit,
            max_stack_size: config.max_stack_size,
        });

        Self {
            config,
            html: html.into(),
            lifecycle: Lifecycle::Created,
            sandbox,
            bootstrapped: false,
            fetcher,
            styles,
            bridge: None,
            recorder,
            tracker,
            output_html: None,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Last serialization produced by `track_changes`
    pub fn output_html(&self) -> Option<&str> {
        self.output_html.as_deref()
    }

    /// Start the worker. Must be called from inside a tokio runtime.
    pub async fn start(&mut self) -> Result<(), SandboxError> {
        if self.lifecycle != Lifecycle::Created {
            return Err(SandboxError::AlreadyStarted);
        }

        let handle = self.sandbox.start().await?;
        self.bridge = Some(CallbackBridge::new(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.styles),
            handle,
            Handle::current(),
            self.config.exec_timeout(),
        ));
        self.lifecycle = Lifecycle::Running;

        tracing::info!(session = %self.config.id, origin = %self.fetcher.origin(), "Session started");
        Ok(())
    }

    /// Evaluate one script; the value is the completion value coerced to a string
    pub async fn exec(&mut self, request: ExecRequest) -> Result<String, ExecError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(ExecError::NotRunning);
        }
        if request.is_bootstrap && self.bootstrapped {
            return Err(ExecError::AlreadyBootstrapped);
        }

        let script = strip_comment_markers(&request.script);
        if let Some(path) = &self.config.dump_script {
            let composed = if request.is_bootstrap {
                format!("{}\n{}", shim::BOOTSTRAP, script)
            } else {
                script.clone()
            };
            if let Err(err) = tokio::fs::write(path, composed).await {
                tracing::warn!(path = %path.display(), "Failed to dump script: {}", err);
            }
        }

        let setup = match (request.is_bootstrap, &self.bridge) {
            (true, Some(bridge)) => Some(ShimSetup {
                html: self.html.clone(),
                page_url: self.config.page_url.clone(),
                referrer: self
                    .config
                    .referrer
                    .clone()
                    .unwrap_or_else(|| self.fetcher.origin().to_string()),
                bridge: Arc::clone(bridge),
                recorder: self.recorder.clone(),
            }),
            (true, None) => return Err(ExecError::NotRunning),
            (false, _) => None,
        };
        if setup.is_some() {
            self.bootstrapped = true;
        }

        let handle = self.sandbox.handle()?.clone();
        let job_handle = handle.clone();
        let (turn, rx) = handle.run_settled(move |ctx| {
            let started = Instant::now();
            evaluate(&ctx, setup, &script).map_err(|err| {
                diagnostics::classify(
                    &ctx,
                    err,
                    job_handle.was_interrupted(),
                    started.elapsed(),
                    &script,
                )
            })
        })?;
        tracing::debug!(turn, bootstrap = request.is_bootstrap, "Exec scheduled");

        let outcome = TimeoutGuard::supervise(
            &handle,
            turn,
            rx,
            self.config.exec_timeout(),
            |outcome| match outcome {
                Ok(_) => ExecEvent::ResultReady,
                Err(_) => ExecEvent::ErrorReady,
            },
        )
        .await
        .ok_or(ExecError::WorkerStopped)?;

        if let Err(err) = &outcome {
            if err.is_interrupt() {
                tracing::warn!(turn, "Exec interrupted: {}", err);
            } else {
                tracing::debug!(turn, "Exec failed: {}", err);
            }
        }
        outcome
    }

    /// Wait for the document to settle and re-serialize it if anything changed
    pub async fn track_changes(&mut self) -> Result<Changes, ExecError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(ExecError::NotRunning);
        }

        let report = self.tracker.drain().await;
        if report.observed == 0 {
            return Ok(Changes {
                html: self.output_html.clone().unwrap_or_default(),
                changed: false,
            });
        }

        tracing::debug!(
            observed = report.observed,
            nodes = report.selectors.len(),
            "Document changed, serializing"
        );
        let html = self.exec(ExecRequest::script(SERIALIZE_SCRIPT)).await?;
        self.output_html = Some(html.clone());
        Ok(Changes {
            html,
            changed: true,
        })
    }

    /// Fire the document's load sequence
    pub async fn close_doc(&mut self) -> Result<(), ExecError> {
        self.exec(ExecRequest::script(CLOSE_SCRIPT)).await.map(|_| ())
    }

    /// Click the first element matching `selector`, then track changes
    pub async fn click(&mut self, selector: &str) -> Result<ClickOutcome, ExecError> {
        let fired = self.exec(ExecRequest::script(click_script(selector))).await? == "true";
        if !fired {
            tracing::debug!(selector, "Click had nothing to run");
        }
        let changes = self.track_changes().await?;
        Ok(ClickOutcome { fired, changes })
    }

    /// Set an attribute on the first element matching `selector`.
    ///
    /// Returns false if nothing matched.
    pub async fn put_attr(&mut self, selector: &str, name: &str, value: &str) -> Result<bool, ExecError> {
        let matched = self
            .exec(ExecRequest::script(put_attr_script(selector, name, value)))
            .await?;
        Ok(matched == "true")
    }

    /// Cancel pending callbacks and shut the worker down. Idempotent.
    pub async fn stop(&mut self) {
        if self.lifecycle == Lifecycle::Stopped {
            return;
        }
        if let Some(bridge) = self.bridge.take() {
            bridge.abort_all();
        }
        self.sandbox.stop().await;
        self.lifecycle = Lifecycle::Stopped;
        tracing::info!(session = %self.config.id, "Session stopped");
    }
}

fn evaluate(ctx: &Ctx<'_>, setup: Option<ShimSetup>, script: &str) -> rquickjs::Result<String> {
    if let Some(setup) = setup {
        shim::install(ctx, setup)?;
    }
    ctx.eval::<Coerced<String>, _>(script).map(|value| value.0)
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Listener present: dispatch a click. Submit or button role inside a form:
/// run the form's submit handlers, then submit unless one prevented it.
fn click_script(selector: &str) -> String {
    format!(
        r#"(function (selector) {{
  var el = document.querySelector(selector);
  if (!el) return false;
  var listeners = el._listeners && el._listeners.click;
  if ((listeners && listeners.length) || typeof el.onclick === 'function' || el.hasAttribute('onclick')) {{
    el.click();
    return true;
  }}
  var type = String(el.type || '').toLowerCase();
  if (type !== 'submit' && type !== 'button') return false;
  for (var p = el.parentElement; p; p = p.parentElement) {{
    if (p.tagName === 'FORM') {{
      var event = new Event('submit', {{ bubbles: true, cancelable: true }});
      if (p.dispatchEvent(event)) p.submit();
      return true;
    }}
  }}
  return false;
}})({})"#,
        js_string(selector)
    )
}

fn put_attr_script(selector: &str, name: &str, value: &str) -> String {
    format!(
        "(function (el) {{ if (el) el.setAttribute({}, {}); return !!el; }})(document.querySelector({}))",
        js_string(name),
        js_string(value),
        js_string(selector)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Fetched, NoStyles};
    use crate::error::BridgeError;
    use async_trait::async_trait;
    use url::Url;

    struct Offline(Url);

    #[async_trait]
    impl Fetcher for Offline {
        fn origin(&self) -> &Url {
            &self.0
        }

        async fn get(&self, url: &Url) -> Result<Fetched, BridgeError> {
            Err(BridgeError::Fetch(format!("offline: {}", url)))
        }
    }

    fn session(html: &str) -> ExecutionSession {
        let config = SessionConfig {
            exec_timeout_ms: 500,
            quiescence_ms: 50,
            ..SessionConfig::default()
        };
        let fetcher = Arc::new(Offline(Url::parse("http://example.com/").unwrap()));
        ExecutionSession::new(config, html, fetcher, Arc::new(NoStyles))
    }

    #[test]
    fn test_scripts_embed_selectors_as_literals() {
        let script = click_script(r#"a[title="it's"]"#);
        assert!(script.ends_with(r#"})("a[title=\"it's\"]")"#));

        let script = put_attr_script("#x", "data-y", "a\nb");
        assert!(script.contains(r#"el.setAttribute("data-y", "a\nb")"#));
        assert!(script.ends_with(r##"(document.querySelector("#x"))"##));
    }

    #[tokio::test]
    async fn test_dump_script_writes_composed_text() {
        let path = std::env::temp_dir().join(format!("sandbox-dump-{}.js", uuid::Uuid::now_v7()));
        let mut session = session("<html><body></body></html>");
        session.config.dump_script = Some(path.clone());
        session.start().await.unwrap();

        session
            .exec(ExecRequest::bootstrap("<!--\nvar x = 1;"))
            .await
            .unwrap();
        let dumped = std::fs::read_to_string(&path).unwrap();
        assert!(dumped.starts_with(shim::BOOTSTRAP));
        assert!(dumped.ends_with("//\nvar x = 1;"));

        session.exec(ExecRequest::script("x + 1")).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x + 1");

        session.stop().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_exec_requires_running_session() {
        let mut session = session("<html><body></body></html>");
        let err = session.exec(ExecRequest::script("1")).await.unwrap_err();
        assert!(matches!(err, ExecError::NotRunning));
        assert_eq!(session.lifecycle(), Lifecycle::Created);
    }

    #[tokio::test]
    async fn test_single_bootstrap() {
        let mut session = session("<html><body><p id='p'>hi</p></body></html>");
        session.start().await.unwrap();

        let text = session
            .exec(ExecRequest::bootstrap("document.getElementById('p').textContent"))
            .await
            .unwrap();
        assert_eq!(text, "hi");

        let err = session.exec(ExecRequest::bootstrap("1")).await.unwrap_err();
        assert!(matches!(err, ExecError::AlreadyBootstrapped));

        session.stop().await;
        session.stop().await;
        assert_eq!(session.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_compile_and_runtime_errors() {
        let mut session = session("<html><body></body></html>");
        session.start().await.unwrap();
        session.exec(ExecRequest::bootstrap("")).await.unwrap();

        let err = session.exec(ExecRequest::script("var = ;")).await.unwrap_err();
        assert_eq!(err.kind(), "compile");

        let err = session
            .exec(ExecRequest::script("\nnull.field;"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "runtime");

        // The engine stays usable
        assert_eq!(session.exec(ExecRequest::script("1 + 1")).await.unwrap(), "2");
        session.stop().await;
    }

    #[tokio::test]
    async fn test_put_attr() {
        let mut session = session("<html><body><a id='link'>x</a></body></html>");
        session.start().await.unwrap();
        session.exec(ExecRequest::bootstrap("")).await.unwrap();

        assert!(session.put_attr("#link", "href", "/next").await.unwrap());
        assert!(!session.put_attr("#missing", "href", "/next").await.unwrap());

        let changes = session.track_changes().await.unwrap();
        assert!(changes.changed);
        assert!(changes.html.contains(r#"href="/next""#));
        session.stop().await;
    }
}
