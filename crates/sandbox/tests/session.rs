use async_trait::async_trait;
use sandbox::{
    BridgeError, ExecError, ExecRequest, ExecutionSession, Fetched, Fetcher, SessionConfig,
    StyleProvider,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

const PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Test page</title></head>
<body>
<h1 id="title">old title</h1>
<div id="out"></div>
<button id="counter">count</button>
<button id="silent">silent</button>
<span id="plain">plain</span>
<form id="signup" action="/signup"><input name="email"><button id="send" type="submit">send</button></form>
</body>
</html>"#;

struct CountingFetcher {
    origin: Url,
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for CountingFetcher {
    fn origin(&self) -> &Url {
        &self.origin
    }

    async fn get(&self, url: &Url) -> Result<Fetched, BridgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Fetched {
            bytes: format!("payload for {}", url.path()).into_bytes(),
            content_type: Some("text/plain".to_string()),
        })
    }
}

#[derive(Default)]
struct RecordingStyles {
    queries: Mutex<Vec<(String, String)>>,
}

impl StyleProvider for RecordingStyles {
    fn query(&self, selector: &str, property: &str) -> Result<String, BridgeError> {
        self.queries
            .lock()
            .unwrap()
            .push((selector.to_string(), property.to_string()));
        match property {
            "display" => Ok("block".to_string()),
            _ => Err(BridgeError::Style(format!("no value for {}", property))),
        }
    }
}

struct Harness {
    session: ExecutionSession,
    fetcher: Arc<CountingFetcher>,
    styles: Arc<RecordingStyles>,
}

async fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = SessionConfig {
        exec_timeout_ms: 500,
        quiescence_ms: 100,
        page_url: "http://example.com/page".to_string(),
        ..SessionConfig::default()
    };
    let fetcher = Arc::new(CountingFetcher {
        origin: Url::parse("http://example.com/page").unwrap(),
        calls: AtomicUsize::new(0),
    });
    let styles = Arc::new(RecordingStyles::default());

    let mut session = ExecutionSession::new(config, PAGE, fetcher.clone(), styles.clone());
    session.start().await.unwrap();
    Harness {
        session,
        fetcher,
        styles,
    }
}

async fn exec(harness: &mut Harness, script: &str) -> Result<String, ExecError> {
    harness.session.exec(ExecRequest::script(script)).await
}

#[tokio::test]
async fn bootstrap_state_is_visible_to_later_scripts() {
    let mut h = harness().await;
    h.session
        .exec(ExecRequest::bootstrap("var state = 'empty';"))
        .await
        .unwrap();

    let value = exec(&mut h, "state = state + '!'; state").await.unwrap();
    assert_eq!(value, "empty!");
    assert_eq!(exec(&mut h, "state").await.unwrap(), "empty!");
    h.session.stop().await;
}

#[tokio::test]
async fn bootstrap_exposes_sandbox_object() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    assert_eq!(
        exec(&mut h, "typeof __sandbox.XHR + ',' + typeof __sandbox.Mutated + ',' + typeof __native")
            .await
            .unwrap(),
        "function,function,undefined"
    );
    assert_eq!(
        exec(&mut h, "__sandbox.HTML.indexOf('old title') > 0").await.unwrap(),
        "true"
    );
    assert_eq!(
        exec(&mut h, "__sandbox.Referrer()").await.unwrap(),
        "http://example.com/page"
    );
    h.session.stop().await;
}

#[tokio::test]
async fn comment_markers_are_stripped() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();
    assert_eq!(exec(&mut h, "<!--\n40 + 2\n-->").await.unwrap(), "42");
    h.session.stop().await;
}

#[tokio::test]
async fn track_changes_without_mutation_is_unchanged() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    let first = h.session.track_changes().await.unwrap();
    let second = h.session.track_changes().await.unwrap();
    assert!(!first.changed);
    assert!(!second.changed);
    h.session.stop().await;
}

#[tokio::test]
async fn inner_html_mutation_is_tracked() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    exec(&mut h, "document.getElementById('title').innerHTML = 'new title'")
        .await
        .unwrap();
    let changes = h.session.track_changes().await.unwrap();
    assert!(changes.changed);
    assert!(changes.html.contains("new title"));
    assert!(!changes.html.contains("old title"));
    assert_eq!(h.session.output_html(), Some(changes.html.as_str()));

    // Nothing new since the snapshot
    let again = h.session.track_changes().await.unwrap();
    assert!(!again.changed);
    assert_eq!(again.html, changes.html);
    h.session.stop().await;
}

#[tokio::test]
async fn detached_nodes_do_not_signal_changes() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    exec(
        &mut h,
        "var d = document.createElement('div'); d.setAttribute('x', '1'); d.textContent = 'off-tree';",
    )
    .await
    .unwrap();
    assert!(!h.session.track_changes().await.unwrap().changed);

    exec(&mut h, "document.body.appendChild(d)").await.unwrap();
    let changes = h.session.track_changes().await.unwrap();
    assert!(changes.changed);
    assert!(changes.html.contains(r#"<div x="1">off-tree</div>"#));
    h.session.stop().await;
}

#[tokio::test]
async fn runaway_script_is_interrupted_and_session_recovers() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("var alive = 1;")).await.unwrap();

    let err = exec(&mut h, "while (true) {}").await.unwrap_err();
    assert!(err.is_interrupt(), "{:?}", err);
    assert_eq!(err.kind(), "interrupt");

    assert_eq!(exec(&mut h, "alive + 1").await.unwrap(), "2");
    h.session.stop().await;
}

#[tokio::test]
async fn runaway_promise_callback_is_interrupted() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    let scheduled = tokio::time::timeout(
        Duration::from_secs(5),
        exec(&mut h, "Promise.resolve().then(function () { for (;;) {} }); 'scheduled'"),
    )
    .await
    .expect("exec settles after the interrupt");
    assert_eq!(scheduled.unwrap(), "scheduled");

    let value = tokio::time::timeout(Duration::from_secs(5), exec(&mut h, "1 + 1"))
        .await
        .expect("session stays usable");
    assert_eq!(value.unwrap(), "2");
    h.session.stop().await;
}

#[tokio::test]
async fn runaway_fetch_handler_is_interrupted() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    exec(&mut h, "fetch('/slow').then(function () { for (;;) {} })")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let value = tokio::time::timeout(Duration::from_secs(5), exec(&mut h, "'alive'"))
        .await
        .expect("session stays usable");
    assert_eq!(value.unwrap(), "alive");
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
    h.session.stop().await;
}

#[tokio::test]
async fn runaway_timer_is_interrupted() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    exec(&mut h, "setTimeout(function () { while (true) {} }, 0)")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(exec(&mut h, "'still here'").await.unwrap(), "still here");
    h.session.stop().await;
}

#[tokio::test]
async fn xhr_fetches_once_and_completes_before_quiescence() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    exec(
        &mut h,
        r#"__sandbox.XHR('GET', '/data.txt', {}, null, function (body, error) {
            document.getElementById('out').textContent = error ? 'failed' : body;
        });"#,
    )
    .await
    .unwrap();

    let changes = h.session.track_changes().await.unwrap();
    assert!(changes.changed);
    assert!(changes.html.contains("payload for /data.txt"));
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
    h.session.stop().await;
}

#[tokio::test]
async fn xml_http_request_fires_load() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    exec(
        &mut h,
        r#"var xhr = new XMLHttpRequest();
        xhr.open('get', 'api/items');
        xhr.onload = function () {
            document.getElementById('out').setAttribute('data-status', xhr.status + ':' + xhr.readyState);
            document.getElementById('out').textContent = xhr.responseText;
        };
        xhr.send();"#,
    )
    .await
    .unwrap();

    let changes = h.session.track_changes().await.unwrap();
    assert!(changes.html.contains(r#"data-status="200:4""#));
    assert!(changes.html.contains("payload for /api/items"));
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
    h.session.stop().await;
}

#[tokio::test]
async fn cross_origin_xhr_is_refused() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    exec(
        &mut h,
        r#"__sandbox.XHR('GET', 'http://elsewhere.test/x', {}, null, function (body, error) {
            document.getElementById('out').textContent = body === '' ? error : 'unexpected';
        });"#,
    )
    .await
    .unwrap();

    let changes = h.session.track_changes().await.unwrap();
    assert!(changes
        .html
        .contains("cannot do crossorigin request to http://elsewhere.test/x"));
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    h.session.stop().await;
}

#[tokio::test]
async fn throwing_callback_does_not_break_worker() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    exec(
        &mut h,
        "__sandbox.XHR('GET', '/a', {}, null, function () { throw new Error('boom'); });",
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(exec(&mut h, "'alive'").await.unwrap(), "alive");
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
    h.session.stop().await;
}

#[tokio::test]
async fn computed_style_goes_through_provider() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    let display = exec(
        &mut h,
        "getComputedStyle(document.getElementById('title')).getPropertyValue('display')",
    )
    .await
    .unwrap();
    assert_eq!(display, "block");

    // Provider failures read as empty
    let color = exec(&mut h, "getComputedStyle(document.body).color").await.unwrap();
    assert_eq!(color, "");

    let queries = h.styles.queries.lock().unwrap().clone();
    assert_eq!(queries[0].1, "display");
    assert!(queries[0].0.starts_with("html > "));
    assert_eq!(queries[1].1, "color");
    h.session.stop().await;
}

#[tokio::test]
async fn timers_reenter_the_worker() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();

    exec(
        &mut h,
        r#"var ticks = 0;
        var id = setInterval(function () {
            ticks++;
            if (ticks === 3) {
                clearInterval(id);
                document.getElementById('out').textContent = 'ticks ' + ticks;
            }
        }, 10);
        setTimeout(function () { document.title = 'later'; }, 20);"#,
    )
    .await
    .unwrap();

    let changes = h.session.track_changes().await.unwrap();
    assert!(changes.changed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(exec(&mut h, "ticks").await.unwrap(), "3");
    assert_eq!(exec(&mut h, "document.title").await.unwrap(), "later");
    h.session.stop().await;
}

#[tokio::test]
async fn click_reports_listener_effects() {
    let mut h = harness().await;
    h.session
        .exec(ExecRequest::bootstrap(
            r#"var clicks = 0;
            document.getElementById('counter').addEventListener('click', function () {
                clicks++;
                document.getElementById('out').textContent = 'clicked ' + clicks;
            });
            document.getElementById('silent').addEventListener('click', function () { clicks += 100; });"#,
        ))
        .await
        .unwrap();

    let outcome = h.session.click("#counter").await.unwrap();
    assert!(outcome.fired);
    assert!(outcome.changes.changed);
    assert!(outcome.changes.html.contains("clicked 1"));

    let outcome = h.session.click("#silent").await.unwrap();
    assert!(outcome.fired);
    assert!(!outcome.changes.changed);

    let outcome = h.session.click("#plain").await.unwrap();
    assert!(!outcome.fired);
    assert!(!outcome.changes.changed);

    let outcome = h.session.click("#does-not-exist").await.unwrap();
    assert!(!outcome.fired);

    assert_eq!(exec(&mut h, "clicks").await.unwrap(), "101");
    h.session.stop().await;
}

#[tokio::test]
async fn click_submit_button_runs_form_handlers() {
    let mut h = harness().await;
    h.session
        .exec(ExecRequest::bootstrap(
            r#"document.getElementById('signup').onsubmit = function (event) {
                event.preventDefault();
                document.getElementById('out').textContent = 'validated';
            };"#,
        ))
        .await
        .unwrap();

    let outcome = h.session.click("#send").await.unwrap();
    assert!(outcome.fired);
    assert!(outcome.changes.html.contains("validated"));
    assert_eq!(
        exec(&mut h, "document.getElementById('signup')._submitted === true")
            .await
            .unwrap(),
        "false"
    );
    h.session.stop().await;
}

#[tokio::test]
async fn close_doc_runs_load_sequence() {
    let mut h = harness().await;
    h.session
        .exec(ExecRequest::bootstrap(
            r#"var seen = [document.readyState];
            document.addEventListener('DOMContentLoaded', function () { seen.push('dom:' + document.readyState); });
            window.onload = function () { seen.push('load:' + document.readyState); };"#,
        ))
        .await
        .unwrap();

    h.session.close_doc().await.unwrap();
    h.session.close_doc().await.unwrap();
    assert_eq!(
        exec(&mut h, "seen.join(',')").await.unwrap(),
        "loading,dom:interactive,load:complete"
    );
    h.session.stop().await;
}

#[tokio::test]
async fn exec_after_stop_fails() {
    let mut h = harness().await;
    h.session.exec(ExecRequest::bootstrap("")).await.unwrap();
    h.session.stop().await;

    let err = exec(&mut h, "1").await.unwrap_err();
    assert!(matches!(err, ExecError::NotRunning));
}
