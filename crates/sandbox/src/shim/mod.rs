//! DOM Shim - the browser-like world page scripts run in
//!
//! `install` parses the page into a [`DomService`] owned by the worker,
//! exposes it to JS as a `__native` object and evaluates `bootstrap.js`,
//! which builds `window`, `document`, events, timers, XHR and
//! `__sandbox` on top of it.
//!
//! ```text
//!   page script ──▶ bootstrap.js wrappers ──▶ __native ──▶ DomService
//!                                                 │
//!                                                 ├──▶ MutationRecorder
//!                                                 └──▶ CallbackBridge
//! ```

mod natives;

use dom::DomService;
use rquickjs::{Ctx, Exception, Object};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use url::Url;

use crate::bridge::CallbackBridge;
use crate::events::MutationRecorder;
use natives::Shared;

pub const BOOTSTRAP: &str = include_str!("bootstrap.js");

/// Global holding the natives until the bootstrap captures and removes it
pub const NATIVE_GLOBAL: &str = "__native";

/// Everything the shim needs from the session
pub struct ShimSetup {
    pub html: String,
    pub page_url: String,
    pub referrer: String,
    pub bridge: Arc<CallbackBridge>,
    pub recorder: MutationRecorder,
}

/// Load the page and install the shim into `ctx`
pub fn install(ctx: &Ctx<'_>, setup: ShimSetup) -> rquickjs::Result<()> {
    let dom = DomService::from_html(&setup.html)
        .map_err(|err| Exception::throw_message(ctx, &format!("failed to load page: {}", err)))?;
    tracing::debug!(nodes = dom.arena().len(), "Page loaded into the shim");

    let shared = Rc::new(Shared {
        dom: RefCell::new(dom),
        recorder: setup.recorder,
        bridge: setup.bridge,
    });

    let native = natives::native_object(ctx, &shared)?;
    native.set("html", setup.html.as_str())?;
    native.set("referrer", setup.referrer.as_str())?;
    native.set("location", location_object(ctx, &setup.page_url)?)?;

    ctx.globals().set(NATIVE_GLOBAL, native)?;
    ctx.eval::<(), _>(BOOTSTRAP)
}

/// `window.location` fields for `page_url`
fn location_object<'js>(ctx: &Ctx<'js>, page_url: &str) -> rquickjs::Result<Object<'js>> {
    let location = Object::new(ctx.clone())?;
    let url = match Url::parse(page_url) {
        Ok(url) => url,
        Err(err) => {
            tracing::warn!(page_url, "Invalid page URL, using about:blank: {}", err);
            location.set("href", "about:blank")?;
            location.set("protocol", "about:")?;
            location.set("origin", "null")?;
            for field in ["host", "hostname", "port", "search", "hash"] {
                location.set(field, "")?;
            }
            location.set("pathname", "blank")?;
            return Ok(location);
        }
    };

    let hostname = url.host_str().unwrap_or("").to_string();
    let host = match url.port() {
        Some(port) => format!("{}:{}", hostname, port),
        None => hostname.clone(),
    };

    location.set("href", url.as_str())?;
    location.set("protocol", format!("{}:", url.scheme()))?;
    location.set("origin", url.origin().ascii_serialization())?;
    location.set("host", host)?;
    location.set("hostname", hostname)?;
    location.set("port", url.port().map(|p| p.to_string()).unwrap_or_default())?;
    location.set("pathname", url.path())?;
    location.set("search", url.query().map(|q| format!("?{}", q)).unwrap_or_default())?;
    location.set(
        "hash",
        url.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
    )?;
    Ok(location)
}
