//! DOM Serializer - Convert the arena back to HTML
//!
//! This module handles:
//! - outerHTML / innerHTML of any node
//! - Escaping of text and attribute values
//! - Void and raw-text elements

use crate::arena::DomArena;
use crate::error::Result;
use crate::types::*;

/// Serializer configuration
#[derive(Debug, Clone)]
pub struct SerializerConfig {
    /// Emit `<!DOCTYPE html>` when serializing a document node
    pub emit_doctype: bool,
    /// Keep comment nodes in the output
    pub include_comments: bool,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            emit_doctype: true,
            include_comments: true,
        }
    }
}

/// HTML serializer over a [`DomArena`]
pub struct DomSerializer {
    config: SerializerConfig,
}

impl DomSerializer {
    pub fn new() -> Self {
        Self::with_config(SerializerConfig::default())
    }

    pub fn with_config(config: SerializerConfig) -> Self {
        Self { config }
    }

    /// Serialize the whole document
    pub fn serialize(&self, arena: &DomArena) -> Result<String> {
        let mut output = String::with_capacity(4096);

        if let Some(root_id) = arena.root_id() {
            self.serialize_node(arena, root_id, false, &mut output)?;
        }

        Ok(output)
    }

    /// The node itself and its subtree
    pub fn outer_html(&self, arena: &DomArena, node_id: NodeId) -> Result<String> {
        let mut output = String::with_capacity(256);
        self.serialize_node(arena, node_id, false, &mut output)?;
        Ok(output)
    }

    /// The node's children only
    pub fn inner_html(&self, arena: &DomArena, node_id: NodeId) -> Result<String> {
        let node = arena.get(node_id)?;
        let raw = node.tag_name().map(is_raw_text_element).unwrap_or(false);
        let mut output = String::with_capacity(256);
        for &child_id in &node.children_ids {
            self.serialize_node(arena, child_id, raw, &mut output)?;
        }
        Ok(output)
    }

    fn serialize_node(
        &self,
        arena: &DomArena,
        node_id: NodeId,
        raw_text: bool,
        output: &mut String,
    ) -> Result<()> {
        let node = arena.get(node_id)?;

        match node.node_type {
            NodeType::Element => {
                let tag = node.node_name.as_str();
                output.push('<');
                output.push_str(tag);
                for (name, value) in node.attributes.iter() {
                    output.push(' ');
                    output.push_str(name);
                    output.push_str("=\"");
                    escape_into(value, true, output);
                    output.push('"');
                }
                output.push('>');

                if is_void_element(tag) {
                    return Ok(());
                }

                let raw = is_raw_text_element(tag);
                for &child_id in &node.children_ids {
                    self.serialize_node(arena, child_id, raw, output)?;
                }

                output.push_str("</");
                output.push_str(tag);
                output.push('>');
            }
            NodeType::Text => {
                if raw_text {
                    output.push_str(&node.node_value);
                } else {
                    escape_into(&node.node_value, false, output);
                }
            }
            NodeType::Comment => {
                if self.config.include_comments {
                    output.push_str("<!--");
                    output.push_str(&node.node_value);
                    output.push_str("-->");
                }
            }
            NodeType::DocumentType => {
                output.push_str("<!DOCTYPE ");
                output.push_str(if node.node_value.is_empty() {
                    "html"
                } else {
                    &node.node_value
                });
                output.push('>');
            }
            NodeType::Document => {
                let has_doctype = node.children_ids.iter().any(|&id| {
                    arena
                        .get(id)
                        .map(|n| n.node_type == NodeType::DocumentType)
                        .unwrap_or(false)
                });
                if self.config.emit_doctype && !has_doctype {
                    output.push_str("<!DOCTYPE html>");
                }
                for &child_id in &node.children_ids {
                    self.serialize_node(arena, child_id, false, output)?;
                }
            }
            NodeType::DocumentFragment => {
                for &child_id in &node.children_ids {
                    self.serialize_node(arena, child_id, raw_text, output)?;
                }
            }
        }

        Ok(())
    }
}

impl Default for DomSerializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape text content (`&`, `<`, `>`) or attribute values (`&`, `"`)
fn escape_into(text: &str, attribute: bool, output: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '\u{a0}' => output.push_str("&nbsp;"),
            '"' if attribute => output.push_str("&quot;"),
            '<' if !attribute => output.push_str("&lt;"),
            '>' if !attribute => output.push_str("&gt;"),
            _ => output.push(ch),
        }
    }
}
