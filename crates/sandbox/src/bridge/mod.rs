//! Callback Bridge - host capabilities reachable from the script world
//!
//! - `Style` is answered synchronously on the worker.
//! - `XHR` and timers run as tokio tasks off the worker and re-enter it
//!   through `RunOnLoop` when they complete.
//!
//! Nothing here ever raises into the script: failures become an empty
//! value (style) or an error string handed to the callback (XHR), plus a
//! log line. A callback that throws is caught at the reentry boundary.

pub mod fetch;
pub mod style;

use dashmap::DashMap;
use rquickjs::{Ctx, Function};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub use fetch::{same_origin, Fetched, Fetcher, XhrRequest};
pub use style::{NoStyles, StyleProvider};

use crate::diagnostics::CaughtException;
use crate::error::BridgeError;
use crate::sandbox::LoopHandle;
use crate::watchdog::{ExecEvent, TimeoutGuard};

/// Global JS function invoked as `(id, body, error)` when an XHR completes
pub const XHR_COMPLETE: &str = "__sandbox_xhr_complete";
/// Global JS function invoked as `(id)` when a timer fires
pub const TIMER_FIRE: &str = "__sandbox_timer_fire";

/// XHR parameters as passed by the script
#[derive(Debug, Clone, Default)]
pub struct ScriptRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

pub struct CallbackBridge {
    fetcher: Arc<dyn Fetcher>,
    styles: Arc<dyn StyleProvider>,
    loop_handle: LoopHandle,
    runtime: Handle,
    /// Deadline for each reentrant callback turn
    callback_timeout: Duration,

    /// In-flight XHR tasks, keyed by a bridge-local id
    requests: DashMap<u64, JoinHandle<()>>,
    next_request: AtomicU64,

    /// Armed timers, keyed by the script's timer id
    timers: DashMap<u32, JoinHandle<()>>,
}

impl CallbackBridge {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        styles: Arc<dyn StyleProvider>,
        loop_handle: LoopHandle,
        runtime: Handle,
        callback_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            styles,
            loop_handle,
            runtime,
            callback_timeout,
            requests: DashMap::new(),
            next_request: AtomicU64::new(1),
            timers: DashMap::new(),
        })
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    /// Computed style lookup; empty string on any failure
    pub fn style(
        &self,
        selector: &str,
        pseudo: Option<&str>,
        property: &str,
        property2: Option<&str>,
    ) -> String {
        if pseudo.is_some() || property2.is_some() {
            tracing::debug!(
                selector,
                pseudo,
                property2,
                "Pseudo-element and priority arguments are ignored"
            );
        }

        match self.styles.query(selector, property) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(selector, property, "Style lookup failed: {}", err);
                String::new()
            }
        }
    }

    /// Start an XHR; `id` is handed back to the script on completion
    pub fn xhr(self: &Arc<Self>, id: u32, request: ScriptRequest) {
        let key = self.next_request.fetch_add(1, Ordering::Relaxed);
        let bridge = Arc::clone(self);

        let task = self.runtime.spawn(async move {
            let url = request.url.clone();
            let (body, error) = match bridge.perform(request).await {
                Ok(fetched) => (fetched.text(), String::new()),
                Err(err) => {
                    tracing::warn!(url = %url, "XHR failed: {}", err);
                    (String::new(), err.to_string())
                }
            };
            bridge.requests.remove(&key);

            bridge
                .reenter("xhr", move |ctx| {
                    let result = ctx
                        .globals()
                        .get::<_, Function>(XHR_COMPLETE)
                        .and_then(|complete| complete.call::<_, ()>((id, body, error)));
                    if let Err(err) = result {
                        report_callback_fault(&ctx, "xhr", id, err);
                    }
                })
                .await;
        });

        self.requests.retain(|_, task| !task.is_finished());
        self.requests.insert(key, task);
    }

    async fn perform(&self, request: ScriptRequest) -> Result<Fetched, BridgeError> {
        let target = self.fetcher.linked_url(&request.url)?;
        if !same_origin(self.fetcher.origin(), &target) {
            tracing::info!(origin = %self.fetcher.origin(), target = %target, "Refusing cross-origin XHR");
            return Err(BridgeError::CrossOrigin {
                target: target.to_string(),
            });
        }

        let method = if request.method.is_empty() {
            "GET".to_string()
        } else {
            request.method.to_ascii_uppercase()
        };
        tracing::debug!(method = %method, url = %target, "XHR");

        self.fetcher
            .request(&XhrRequest {
                method,
                url: target,
                headers: request.headers,
                body: request.body,
            })
            .await
    }

    /// Arm a timer; an existing timer with the same id is replaced
    pub fn schedule_timer(self: &Arc<Self>, id: u32, delay: Duration) {
        let bridge = Arc::clone(self);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            bridge.timers.remove(&id);

            bridge
                .reenter("timer", move |ctx| {
                    let result = ctx
                        .globals()
                        .get::<_, Function>(TIMER_FIRE)
                        .and_then(|fire| fire.call::<_, ()>((id,)));
                    if let Err(err) = result {
                        report_callback_fault(&ctx, "timer", id, err);
                    }
                })
                .await;
        });

        if let Some(previous) = self.timers.insert(id, task) {
            previous.abort();
        }
    }

    pub fn cancel_timer(&self, id: u32) {
        if let Some((_, task)) = self.timers.remove(&id) {
            task.abort();
        }
    }

    /// Outstanding XHRs and armed timers
    pub fn pending(&self) -> usize {
        self.requests.iter().filter(|t| !t.is_finished()).count()
            + self.timers.iter().filter(|t| !t.is_finished()).count()
    }

    /// Cancel everything still pending
    pub fn abort_all(&self) {
        for entry in self.requests.iter() {
            entry.value().abort();
        }
        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.requests.clear();
        self.timers.clear();
    }

    /// Run `job` on the worker under the callback deadline
    async fn reenter<F>(&self, label: &'static str, job: F)
    where
        F: for<'js> FnOnce(Ctx<'js>) + Send + 'static,
    {
        let scheduled = self.loop_handle.run_settled(job);

        let (turn, done_rx) = match scheduled {
            Ok(scheduled) => scheduled,
            Err(err) => {
                tracing::debug!(callback = label, "Dropping completion: {}", err);
                return;
            }
        };

        TimeoutGuard::supervise(
            &self.loop_handle,
            turn,
            done_rx,
            self.callback_timeout,
            |_| ExecEvent::ResultReady,
        )
        .await;
    }
}

impl Drop for CallbackBridge {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn report_callback_fault(ctx: &Ctx<'_>, callback: &'static str, id: u32, err: rquickjs::Error) {
    let detail = match err {
        rquickjs::Error::Exception => CaughtException::take(ctx).summary(),
        other => other.to_string(),
    };
    tracing::warn!(callback, id, "Callback fault: {}", detail);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{EngineLimits, ScriptSandbox};
    use async_trait::async_trait;
    use rquickjs::prelude::Coerced;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;
    use url::Url;

    struct Echo {
        origin: Url,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for Echo {
        fn origin(&self) -> &Url {
            &self.origin
        }

        async fn get(&self, url: &Url) -> Result<Fetched, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Fetched {
                bytes: url.path().as_bytes().to_vec(),
                content_type: None,
            })
        }
    }

    struct FixedStyles;

    impl StyleProvider for FixedStyles {
        fn query(&self, selector: &str, property: &str) -> Result<String, BridgeError> {
            match (selector, property) {
                ("#a", "display") => Ok("inline".to_string()),
                _ => Err(BridgeError::Style("nothing".to_string())),
            }
        }
    }

    const RECORDERS: &str = r#"
        var log = [];
        globalThis.__sandbox_xhr_complete = function (id, body, error) { log.push('xhr:' + id + ':' + body + ':' + error); };
        globalThis.__sandbox_timer_fire = function (id) { log.push('timer:' + id); };
    "#;

    async fn eval(handle: &LoopHandle, source: &'static str) -> String {
        let (tx, rx) = oneshot::channel();
        handle
            .run_on_loop(move |ctx| {
                let value = ctx
                    .eval::<Coerced<String>, _>(source)
                    .map(|v| v.0)
                    .unwrap_or_else(|_| "error".to_string());
                let _ = tx.send(value);
            })
            .unwrap();
        rx.await.unwrap()
    }

    async fn setup() -> (ScriptSandbox, LoopHandle, Arc<CallbackBridge>, Arc<Echo>) {
        let mut sandbox = ScriptSandbox::new(EngineLimits::default());
        let handle = sandbox.start().await.unwrap();
        let fetcher = Arc::new(Echo {
            origin: Url::parse("http://example.com/app/").unwrap(),
            calls: AtomicUsize::new(0),
        });
        let bridge = CallbackBridge::new(
            fetcher.clone(),
            Arc::new(FixedStyles),
            handle.clone(),
            Handle::current(),
            Duration::from_millis(500),
        );
        eval(&handle, RECORDERS).await;
        (sandbox, handle, bridge, fetcher)
    }

    #[tokio::test]
    async fn test_style_failures_read_empty() {
        let (mut sandbox, _handle, bridge, _) = setup().await;
        assert_eq!(bridge.style("#a", None, "display", None), "inline");
        assert_eq!(bridge.style("#a", Some("::before"), "display", None), "inline");
        assert_eq!(bridge.style("#b", None, "display", None), "");
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_xhr_reenters_with_body_or_error() {
        let (mut sandbox, handle, bridge, fetcher) = setup().await;

        bridge.xhr(
            1,
            ScriptRequest {
                method: "get".to_string(),
                url: "data.json".to_string(),
                ..ScriptRequest::default()
            },
        );
        bridge.xhr(
            2,
            ScriptRequest {
                url: "http://other.test/x".to_string(),
                ..ScriptRequest::default()
            },
        );
        bridge.xhr(
            3,
            ScriptRequest {
                method: "POST".to_string(),
                url: "/submit".to_string(),
                body: Some("a=1".to_string()),
                ..ScriptRequest::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let log = eval(&handle, "log.sort().join('\\n')").await;
        assert_eq!(
            log,
            "xhr:1:/app/data.json:\n\
             xhr:2::cannot do crossorigin request to http://other.test/x\n\
             xhr:3::Unsupported: POST http://example.com/submit"
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.pending(), 0);
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_timers_fire_and_cancel() {
        let (mut sandbox, handle, bridge, _) = setup().await;

        bridge.schedule_timer(7, Duration::from_millis(10));
        bridge.schedule_timer(8, Duration::from_millis(30));
        bridge.cancel_timer(8);
        bridge.schedule_timer(9, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(eval(&handle, "log.join(',')").await, "timer:7");
        assert_eq!(bridge.pending(), 1);
        bridge.abort_all();
        assert_eq!(bridge.pending(), 0);
        sandbox.stop().await;
    }
}
