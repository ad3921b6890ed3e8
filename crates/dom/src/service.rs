//! DOM Service - Main entry point for DOM operations
//!
//! This handles:
//! - HTML import (scraper/html5ever tree → arena)
//! - Tree mutation used by the script shim
//! - Selector queries with a compiled-selector cache
//! - HTML serialization

use ahash::AHashMap;
use scraper::{Html, Node};

use crate::arena::DomArena;
use crate::error::{DomError, Result};
use crate::scripts::{self, PageScript};
use crate::selector::Selector;
use crate::serializer::DomSerializer;
use crate::types::*;
use crate::utils;

/// Configuration for DOM service
#[derive(Debug, Clone)]
pub struct DomServiceConfig {
    /// Drop whitespace-only text nodes between elements on import
    pub drop_whitespace_text: bool,
    /// Compiled selectors kept before the cache is reset
    pub selector_cache_size: usize,
}

impl Default for DomServiceConfig {
    fn default() -> Self {
        Self {
            drop_whitespace_text: false,
            selector_cache_size: 256,
        }
    }
}

/// Main DOM service
pub struct DomService {
    config: DomServiceConfig,
    arena: DomArena,
    selectors: AHashMap<String, Selector>,
    serializer: DomSerializer,
}

impl DomService {
    /// Create new DOM service with default config
    pub fn new() -> Self {
        Self::with_config(DomServiceConfig::default())
    }

    /// Create DOM service with custom config
    pub fn with_config(config: DomServiceConfig) -> Self {
        Self {
            config,
            arena: DomArena::new(),
            selectors: AHashMap::new(),
            serializer: DomSerializer::new(),
        }
    }

    /// Parse a full document, replacing the current one
    pub fn from_html(html: &str) -> Result<Self> {
        let mut service = Self::new();
        service.load_document(html)?;
        Ok(service)
    }

    /// Get reference to internal arena
    pub fn arena(&self) -> &DomArena {
        &self.arena
    }

    /// Get mutable reference to internal arena
    pub fn arena_mut(&mut self) -> &mut DomArena {
        &mut self.arena
    }

    /// Parse HTML as a complete document and make it the root
    pub fn load_document(&mut self, html: &str) -> Result<NodeId> {
        let parsed = Html::parse_document(html);
        self.arena.clear();

        let document = self
            .arena
            .add_node(DomNode::new(0, NodeType::Document, "#document"));
        self.import_children(parsed.tree.root(), document)?;
        self.arena.set_root(document)?;

        Ok(document)
    }

    /// Parse HTML as a fragment; returns a detached fragment node holding the result
    pub fn parse_fragment(&mut self, html: &str) -> Result<NodeId> {
        let parsed = Html::parse_fragment(html);
        let fragment = self.create_fragment();

        // html5ever wraps fragment content in a synthetic <html> element
        let wrapper = parsed
            .tree
            .root()
            .children()
            .find(|child| child.value().is_element());
        match wrapper {
            Some(wrapper) => self.import_children(wrapper, fragment)?,
            None => self.import_children(parsed.tree.root(), fragment)?,
        }

        Ok(fragment)
    }

    /// Copy the children of a parsed node under `parent`, iteratively
    fn import_children(
        &mut self,
        source: ego_tree::NodeRef<'_, Node>,
        parent: NodeId,
    ) -> Result<()> {
        let mut stack: Vec<(ego_tree::NodeRef<'_, Node>, NodeId)> = source
            .children()
            .rev()
            .map(|child| (child, parent))
            .collect();

        while let Some((source, parent)) = stack.pop() {
            let node = match source.value() {
                Node::Element(element) => {
                    let mut node = DomNode::element(0, element.name());
                    for (name, value) in element.attrs() {
                        node.attributes.set(name, value);
                    }
                    node
                }
                Node::Text(text) => {
                    if self.config.drop_whitespace_text && text.trim().is_empty() {
                        continue;
                    }
                    DomNode::text(0, &**text)
                }
                Node::Comment(comment) => DomNode::comment(0, &**comment),
                Node::Doctype(doctype) => {
                    let mut node = DomNode::new(0, NodeType::DocumentType, "#doctype");
                    node.node_value = doctype.name().to_string();
                    node
                }
                _ => continue,
            };

            let id = self.arena.add_node(node);
            self.arena.append_child(parent, id)?;

            for child in source.children().rev() {
                stack.push((child, id));
            }
        }

        Ok(())
    }

    // ---- document accessors ----

    pub fn document(&self) -> Result<NodeId> {
        self.arena.root_id().ok_or(DomError::NoRoot)
    }

    pub fn document_element(&self) -> Result<Option<NodeId>> {
        let document = self.document()?;
        Ok(self.arena.element_children(document)?.first().copied())
    }

    /// First `<head>` / `<body>` child of the document element
    pub fn document_child(&self, tag: &str) -> Result<Option<NodeId>> {
        let Some(html) = self.document_element()? else {
            return Ok(None);
        };
        Ok(self
            .arena
            .element_children(html)?
            .into_iter()
            .find(|&id| self.arena.get(id).map(|n| n.is_tag(tag)).unwrap_or(false)))
    }

    pub fn node(&self, node_id: NodeId) -> Result<&DomNode> {
        self.arena.get(node_id)
    }

    fn element_mut(&mut self, node_id: NodeId) -> Result<&mut DomNode> {
        let node = self.arena.get_mut(node_id)?;
        if !node.is_element() {
            return Err(DomError::InvalidNodeType {
                expected: NodeType::Element.as_str().to_string(),
                actual: node.node_type.as_str().to_string(),
            });
        }
        Ok(node)
    }

    // ---- creation ----

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.arena.add_node(DomNode::element(0, tag))
    }

    pub fn create_text(&mut self, data: &str) -> NodeId {
        self.arena.add_node(DomNode::text(0, data))
    }

    pub fn create_comment(&mut self, data: &str) -> NodeId {
        self.arena.add_node(DomNode::comment(0, data))
    }

    pub fn create_fragment(&mut self) -> NodeId {
        self.arena.add_node(DomNode::new(
            0,
            NodeType::DocumentFragment,
            "#document-fragment",
        ))
    }

    pub fn clone_node(&mut self, node_id: NodeId, deep: bool) -> Result<NodeId> {
        self.arena.clone_node(node_id, deep)
    }

    // ---- structure ----

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.arena.append_child(parent, child)
    }

    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<()> {
        self.arena.insert_before(parent, child, reference)
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.arena.remove_child(parent, child)
    }

    // ---- attributes ----

    pub fn get_attribute(&self, node_id: NodeId, name: &str) -> Result<Option<String>> {
        Ok(self.arena.get(node_id)?.attr(name).map(str::to_string))
    }

    /// Returns true if the stored value changed
    pub fn set_attribute(&mut self, node_id: NodeId, name: &str, value: &str) -> Result<bool> {
        Ok(self.element_mut(node_id)?.attributes.set(name, value))
    }

    /// Returns true if the attribute existed
    pub fn remove_attribute(&mut self, node_id: NodeId, name: &str) -> Result<bool> {
        Ok(self.element_mut(node_id)?.attributes.remove(name))
    }

    pub fn attribute_names(&self, node_id: NodeId) -> Result<Vec<String>> {
        Ok(self.arena.get(node_id)?.attributes.names())
    }

    // ---- content ----

    pub fn text_content(&self, node_id: NodeId) -> Result<String> {
        utils::get_text_content(&self.arena, node_id)
    }

    /// Replace children with a single text node (or set character data)
    pub fn set_text_content(&mut self, node_id: NodeId, text: &str) -> Result<()> {
        let node = self.arena.get_mut(node_id)?;
        if matches!(node.node_type, NodeType::Text | NodeType::Comment) {
            node.node_value = text.to_string();
            return Ok(());
        }

        self.arena.clear_children(node_id)?;
        if !text.is_empty() {
            let text_id = self.create_text(text);
            self.arena.append_child(node_id, text_id)?;
        }
        Ok(())
    }

    pub fn node_value(&self, node_id: NodeId) -> Result<Option<String>> {
        let node = self.arena.get(node_id)?;
        Ok(match node.node_type {
            NodeType::Text | NodeType::Comment => Some(node.node_value.clone()),
            _ => None,
        })
    }

    pub fn set_node_value(&mut self, node_id: NodeId, value: &str) -> Result<()> {
        let node = self.arena.get_mut(node_id)?;
        if matches!(node.node_type, NodeType::Text | NodeType::Comment) {
            node.node_value = value.to_string();
        }
        Ok(())
    }

    pub fn inner_html(&self, node_id: NodeId) -> Result<String> {
        self.serializer.inner_html(&self.arena, node_id)
    }

    pub fn outer_html(&self, node_id: NodeId) -> Result<String> {
        self.serializer.outer_html(&self.arena, node_id)
    }

    /// Replace children with parsed HTML
    pub fn set_inner_html(&mut self, node_id: NodeId, html: &str) -> Result<()> {
        let raw_text = self
            .arena
            .get(node_id)?
            .tag_name()
            .map(is_raw_text_element)
            .unwrap_or(false);

        self.arena.clear_children(node_id)?;
        if raw_text {
            let text_id = self.create_text(html);
            return self.arena.append_child(node_id, text_id);
        }

        let fragment = self.parse_fragment(html)?;
        self.arena.append_child(node_id, fragment)
    }

    /// Whole document as HTML
    pub fn serialize(&self) -> Result<String> {
        self.serializer.serialize(&self.arena)
    }

    // ---- selectors ----

    fn compiled<'a>(
        cache: &'a mut AHashMap<String, Selector>,
        limit: usize,
        source: &str,
    ) -> Result<&'a Selector> {
        if !cache.contains_key(source) {
            if cache.len() >= limit {
                cache.clear();
            }
            cache.insert(source.to_string(), Selector::parse(source)?);
        }
        cache
            .get(source)
            .ok_or_else(|| DomError::InvalidSelector(source.to_string()))
    }

    pub fn query_selector(&mut self, scope: NodeId, selector: &str) -> Result<Option<NodeId>> {
        let limit = self.config.selector_cache_size;
        let selector = Self::compiled(&mut self.selectors, limit, selector)?;
        selector.query(&self.arena, scope)
    }

    pub fn query_selector_all(&mut self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        let limit = self.config.selector_cache_size;
        let selector = Self::compiled(&mut self.selectors, limit, selector)?;
        selector.query_all(&self.arena, scope)
    }

    /// Search the whole document
    pub fn select(&mut self, selector: &str) -> Result<Vec<NodeId>> {
        let document = self.document()?;
        self.query_selector_all(document, selector)
    }

    pub fn matches(&mut self, node_id: NodeId, selector: &str) -> Result<bool> {
        let limit = self.config.selector_cache_size;
        let selector = Self::compiled(&mut self.selectors, limit, selector)?;
        Ok(selector.matches(&self.arena, node_id))
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<NodeId> {
        self.arena.find_by_id(id)
    }

    pub fn path_selector(&self, node_id: NodeId) -> Result<String> {
        utils::path_selector(&self.arena, node_id)
    }

    pub fn style_property(&self, node_id: NodeId, property: &str) -> Result<Option<String>> {
        utils::style_property(&self.arena, node_id, property)
    }

    /// Set (or with an empty value, remove) one inline style declaration.
    ///
    /// Returns true if the `style` attribute changed.
    pub fn set_style_property(&mut self, node_id: NodeId, property: &str, value: &str) -> Result<bool> {
        let property = property.trim().to_ascii_lowercase();
        let node = self.element_mut(node_id)?;
        let mut declarations = utils::parse_style_attr(node.attr("style").unwrap_or(""));
        declarations.retain(|(name, _)| *name != property);
        if !value.trim().is_empty() {
            declarations.push((property, value.trim().to_string()));
        }

        if declarations.is_empty() {
            return Ok(node.attributes.remove("style"));
        }
        let style = utils::format_style_attr(&declarations);
        Ok(node.attributes.set("style", &style))
    }

    /// True if the node is attached to the document
    pub fn is_connected(&self, node_id: NodeId) -> bool {
        match self.arena.root_id() {
            Some(root) => self.arena.is_inclusive_ancestor(root, node_id).unwrap_or(false),
            None => false,
        }
    }

    pub fn scripts(&self) -> Result<Vec<PageScript>> {
        scripts::collect_scripts(&self.arena, self.document()?)
    }
}

impl Default for DomService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html><html><head><title>t</title></head><body><h1 id="title" class="big">Hello</h1><p>one <b>two</b></p></body></html>"#;

    #[test]
    fn test_import_and_serialize() {
        let service = DomService::from_html(PAGE).unwrap();
        let html = service.serialize().unwrap();
        assert_eq!(html, PAGE);
    }

    #[test]
    fn test_document_accessors() {
        let mut service = DomService::from_html(PAGE).unwrap();
        let html = service.document_element().unwrap().unwrap();
        assert!(service.node(html).unwrap().is_tag("html"));
        let body = service.document_child("body").unwrap().unwrap();
        assert_eq!(service.path_selector(body).unwrap(), "html > :nth-child(2)");

        let title = service.query_selector(body, "h1.big").unwrap().unwrap();
        assert_eq!(service.get_element_by_id("title"), Some(title));
        assert_eq!(service.text_content(body).unwrap(), "Helloone two");
    }

    #[test]
    fn test_inner_html_roundtrip() {
        let mut service = DomService::from_html(PAGE).unwrap();
        let title = service.get_element_by_id("title").unwrap();
        service.set_inner_html(title, "new <i>title</i>").unwrap();
        assert_eq!(service.inner_html(title).unwrap(), "new <i>title</i>");
        assert_eq!(service.select("i").unwrap().len(), 1);
    }

    #[test]
    fn test_set_attribute_reports_change() {
        let mut service = DomService::from_html(PAGE).unwrap();
        let title = service.get_element_by_id("title").unwrap();
        assert!(service.set_attribute(title, "data-x", "1").unwrap());
        assert!(!service.set_attribute(title, "data-x", "1").unwrap());
        assert!(service.remove_attribute(title, "data-x").unwrap());

        let text = service.create_text("x");
        assert!(matches!(
            service.set_attribute(text, "a", "b"),
            Err(DomError::InvalidNodeType { .. })
        ));
    }

    #[test]
    fn test_inline_style_edit() {
        let mut service = DomService::from_html(PAGE).unwrap();
        let title = service.get_element_by_id("title").unwrap();
        assert!(service.set_style_property(title, "Color", "red").unwrap());
        assert!(service.set_style_property(title, "display", "none").unwrap());
        assert_eq!(
            service.get_attribute(title, "style").unwrap().as_deref(),
            Some("color: red; display: none;")
        );
        assert_eq!(service.style_property(title, "display").unwrap().as_deref(), Some("none"));

        assert!(service.set_style_property(title, "color", "").unwrap());
        assert!(service.set_style_property(title, "display", "").unwrap());
        assert_eq!(service.get_attribute(title, "style").unwrap(), None);
    }

    #[test]
    fn test_connected() {
        let mut service = DomService::from_html(PAGE).unwrap();
        let div = service.create_element("div");
        assert!(!service.is_connected(div));
        let body = service.document_child("body").unwrap().unwrap();
        service.append_child(body, div).unwrap();
        assert!(service.is_connected(div));
    }

    #[test]
    fn test_invalid_selector_error() {
        let mut service = DomService::from_html(PAGE).unwrap();
        assert!(matches!(
            service.select("h1["),
            Err(DomError::InvalidSelector(_))
        ));
    }
}
