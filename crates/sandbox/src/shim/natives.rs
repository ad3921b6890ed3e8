//! `__native` functions backing the shim
//!
//! Every function takes and returns plain values (node ids, strings,
//! booleans). Node wrappers, events and listeners live in `bootstrap.js`.
//!
//! Mutations are recorded here, after the store accepted the change, and
//! only for nodes attached to the document.

use dom::{DomError, DomService, NodeId, NodeType};
use rquickjs::function::IntoJsFunc;
use rquickjs::{Ctx, Exception, Function, Object};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{CallbackBridge, ScriptRequest};
use crate::events::{MutationKind, MutationRecorder};

/// State shared by all natives of one worker context
pub(super) struct Shared {
    pub dom: RefCell<DomService>,
    pub recorder: MutationRecorder,
    pub bridge: Arc<CallbackBridge>,
}

impl Shared {
    fn read<R>(
        &self,
        ctx: &Ctx<'_>,
        f: impl FnOnce(&DomService) -> dom::Result<R>,
    ) -> rquickjs::Result<R> {
        let dom = self
            .dom
            .try_borrow()
            .map_err(|_| Exception::throw_message(ctx, "document is busy"))?;
        f(&dom).map_err(|err| throw_dom(ctx, err))
    }

    fn write<R>(
        &self,
        ctx: &Ctx<'_>,
        f: impl FnOnce(&mut DomService) -> dom::Result<R>,
    ) -> rquickjs::Result<R> {
        let mut dom = self
            .dom
            .try_borrow_mut()
            .map_err(|_| Exception::throw_message(ctx, "document is busy"))?;
        f(&mut dom).map_err(|err| throw_dom(ctx, err))
    }

    /// Record a change of `node` if it is part of the document
    fn touch(&self, dom: &DomService, kind: MutationKind, node: NodeId) {
        if !dom.is_connected(node) {
            return;
        }
        match dom.path_selector(node) {
            Ok(path) => {
                self.recorder.record(kind, path);
            }
            Err(err) => tracing::debug!(node, "No path for mutated node: {}", err),
        }
    }

    /// Insert `child` under `parent`, recording both the old and the new parent
    fn insert(
        &self,
        dom: &mut DomService,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> dom::Result<()> {
        let previous = dom.node(child)?.parent_id;
        if let Some(previous) = previous.filter(|&p| p != parent) {
            self.touch(dom, MutationKind::Child, previous);
        }
        dom.insert_before(parent, child, reference)?;
        self.touch(dom, MutationKind::Child, parent);
        Ok(())
    }
}

fn throw_dom(ctx: &Ctx<'_>, err: DomError) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}

fn register<'js, P, F>(ctx: &Ctx<'js>, target: &Object<'js>, name: &str, f: F) -> rquickjs::Result<()>
where
    F: IntoJsFunc<'js, P> + 'js,
{
    let function = Function::new(ctx.clone(), f)?.with_name(name)?;
    target.set(name, function)
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

/// Build the `__native` object
pub(super) fn native_object<'js>(ctx: &Ctx<'js>, shared: &Rc<Shared>) -> rquickjs::Result<Object<'js>> {
    let native = Object::new(ctx.clone())?;
    install_tree(ctx, &native, shared)?;
    install_content(ctx, &native, shared)?;
    install_selectors(ctx, &native, shared)?;
    install_host(ctx, &native, shared)?;
    Ok(native)
}

fn install_tree<'js>(ctx: &Ctx<'js>, native: &Object<'js>, shared: &Rc<Shared>) -> rquickjs::Result<()> {
    let s = Rc::clone(shared);
    register(ctx, native, "document", move |ctx: Ctx<'js>| {
        s.read(&ctx, |dom| dom.document())
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "documentElement", move |ctx: Ctx<'js>| {
        s.read(&ctx, |dom| dom.document_element())
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "documentChild", move |ctx: Ctx<'js>, tag: String| {
        s.read(&ctx, |dom| dom.document_child(&tag))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "nodeType", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| Ok(dom.node(id)?.node_type as u32))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "nodeName", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| Ok(dom.node(id)?.node_name.clone()))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "parent", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| Ok(dom.node(id)?.parent_id))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "children", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| Ok(dom.node(id)?.children_ids.to_vec()))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "connected", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| Ok(dom.is_connected(id)))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "createElement", move |ctx: Ctx<'js>, tag: String| {
        s.write(&ctx, |dom| Ok(dom.create_element(&tag)))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "createText", move |ctx: Ctx<'js>, data: String| {
        s.write(&ctx, |dom| Ok(dom.create_text(&data)))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "createComment", move |ctx: Ctx<'js>, data: String| {
        s.write(&ctx, |dom| Ok(dom.create_comment(&data)))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "createFragment", move |ctx: Ctx<'js>| {
        s.write(&ctx, |dom| Ok(dom.create_fragment()))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "parseFragment", move |ctx: Ctx<'js>, html: String| {
        s.write(&ctx, |dom| dom.parse_fragment(&html))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "cloneNode", move |ctx: Ctx<'js>, id: NodeId, deep: bool| {
        s.write(&ctx, |dom| dom.clone_node(id, deep))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "appendChild", move |ctx: Ctx<'js>, parent: NodeId, child: NodeId| {
        s.write(&ctx, |dom| s.insert(dom, parent, child, None))
    })?;

    let s = Rc::clone(shared);
    register(
        ctx,
        native,
        "insertBefore",
        move |ctx: Ctx<'js>, parent: NodeId, child: NodeId, reference: Option<NodeId>| {
            s.write(&ctx, |dom| s.insert(dom, parent, child, reference))
        },
    )?;

    let s = Rc::clone(shared);
    register(ctx, native, "removeChild", move |ctx: Ctx<'js>, parent: NodeId, child: NodeId| {
        s.write(&ctx, |dom| {
            dom.remove_child(parent, child)?;
            s.touch(dom, MutationKind::Child, parent);
            Ok(())
        })
    })?;

    Ok(())
}

fn install_content<'js>(ctx: &Ctx<'js>, native: &Object<'js>, shared: &Rc<Shared>) -> rquickjs::Result<()> {
    let s = Rc::clone(shared);
    register(ctx, native, "getAttr", move |ctx: Ctx<'js>, id: NodeId, name: String| {
        s.read(&ctx, |dom| dom.get_attribute(id, &name.to_ascii_lowercase()))
    })?;

    let s = Rc::clone(shared);
    register(
        ctx,
        native,
        "setAttr",
        move |ctx: Ctx<'js>, id: NodeId, name: String, value: String| {
            s.write(&ctx, |dom| {
                if dom.set_attribute(id, &name.to_ascii_lowercase(), &value)? {
                    s.touch(dom, MutationKind::Attribute, id);
                }
                Ok(())
            })
        },
    )?;

    let s = Rc::clone(shared);
    register(ctx, native, "removeAttr", move |ctx: Ctx<'js>, id: NodeId, name: String| {
        s.write(&ctx, |dom| {
            if dom.remove_attribute(id, &name.to_ascii_lowercase())? {
                s.touch(dom, MutationKind::Attribute, id);
            }
            Ok(())
        })
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "attrNames", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| dom.attribute_names(id))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "textContent", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| dom.text_content(id))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "setTextContent", move |ctx: Ctx<'js>, id: NodeId, text: String| {
        s.write(&ctx, |dom| {
            let kind = match dom.node(id)?.node_type {
                NodeType::Text | NodeType::Comment => MutationKind::Text,
                _ => MutationKind::Child,
            };
            dom.set_text_content(id, &text)?;
            s.touch(dom, kind, id);
            Ok(())
        })
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "nodeValue", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| dom.node_value(id))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "setNodeValue", move |ctx: Ctx<'js>, id: NodeId, value: String| {
        s.write(&ctx, |dom| {
            if dom.node_value(id)?.is_some_and(|old| old != value) {
                dom.set_node_value(id, &value)?;
                s.touch(dom, MutationKind::Text, id);
            }
            Ok(())
        })
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "innerHTML", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| dom.inner_html(id))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "outerHTML", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| dom.outer_html(id))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "setInnerHTML", move |ctx: Ctx<'js>, id: NodeId, html: String| {
        s.write(&ctx, |dom| {
            dom.set_inner_html(id, &html)?;
            s.touch(dom, MutationKind::Child, id);
            Ok(())
        })
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "styleGet", move |ctx: Ctx<'js>, id: NodeId, property: String| {
        s.read(&ctx, |dom| dom.style_property(id, &property))
    })?;

    let s = Rc::clone(shared);
    register(
        ctx,
        native,
        "styleSet",
        move |ctx: Ctx<'js>, id: NodeId, property: String, value: String| {
            s.write(&ctx, |dom| {
                if dom.set_style_property(id, &property, &value)? {
                    s.touch(dom, MutationKind::Attribute, id);
                }
                Ok(())
            })
        },
    )?;

    Ok(())
}

fn install_selectors<'js>(ctx: &Ctx<'js>, native: &Object<'js>, shared: &Rc<Shared>) -> rquickjs::Result<()> {
    let s = Rc::clone(shared);
    register(ctx, native, "query", move |ctx: Ctx<'js>, scope: NodeId, selector: String| {
        s.write(&ctx, |dom| dom.query_selector(scope, &selector))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "queryAll", move |ctx: Ctx<'js>, scope: NodeId, selector: String| {
        s.write(&ctx, |dom| dom.query_selector_all(scope, &selector))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "matches", move |ctx: Ctx<'js>, id: NodeId, selector: String| {
        s.write(&ctx, |dom| dom.matches(id, &selector))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "byId", move |ctx: Ctx<'js>, id: String| {
        s.read(&ctx, |dom| Ok(dom.get_element_by_id(&id)))
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "path", move |ctx: Ctx<'js>, id: NodeId| {
        s.read(&ctx, |dom| dom.path_selector(id))
    })?;

    Ok(())
}

fn install_host<'js>(ctx: &Ctx<'js>, native: &Object<'js>, shared: &Rc<Shared>) -> rquickjs::Result<()> {
    let s = Rc::clone(shared);
    register(
        ctx,
        native,
        "style",
        move |selector: String, pseudo: String, property: String, property2: String| {
            s.bridge
                .style(&selector, non_empty(&pseudo), &property, non_empty(&property2))
        },
    )?;

    let s = Rc::clone(shared);
    register(
        ctx,
        native,
        "xhr",
        move |id: u32, method: String, url: String, headers: String, body: Option<String>| {
            let headers = serde_json::from_str::<Vec<(String, String)>>(&headers).unwrap_or_else(|err| {
                tracing::debug!(url = %url, "Ignoring malformed XHR headers: {}", err);
                Vec::new()
            });
            s.bridge.xhr(
                id,
                ScriptRequest {
                    method,
                    url,
                    headers,
                    body,
                },
            );
        },
    )?;

    let s = Rc::clone(shared);
    register(ctx, native, "setTimer", move |id: u32, delay_ms: f64| {
        let delay_ms = if delay_ms.is_finite() { delay_ms.max(0.0) } else { 0.0 };
        s.bridge
            .schedule_timer(id, Duration::from_secs_f64(delay_ms / 1000.0));
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "clearTimer", move |id: u32| {
        s.bridge.cancel_timer(id);
    })?;

    let s = Rc::clone(shared);
    register(ctx, native, "mutated", move |code: i32, selector: String| {
        s.recorder.record(MutationKind::from_code(code), selector);
    })?;

    register(ctx, native, "log", |level: String, message: String| match level.as_str() {
        "error" => tracing::error!(target: "sandbox::console", "{}", message),
        "warn" => tracing::warn!(target: "sandbox::console", "{}", message),
        "debug" | "trace" => tracing::debug!(target: "sandbox::console", "{}", message),
        _ => tracing::info!(target: "sandbox::console", "{}", message),
    })?;

    Ok(())
}
