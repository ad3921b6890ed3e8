//! Utility functions for DOM processing

use crate::arena::DomArena;
use crate::error::Result;
use crate::types::{NodeId, NodeType};

/// Cap text length, cutting on a char boundary
pub fn cap_text_length(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Concatenated text of all descendant text nodes
pub fn get_text_content(arena: &DomArena, node_id: NodeId) -> Result<String> {
    let node = arena.get(node_id)?;
    if matches!(node.node_type, NodeType::Text | NodeType::Comment) {
        return Ok(node.node_value.clone());
    }

    let mut text = String::new();
    arena.traverse_df(node_id, |n| {
        if n.is_text() {
            text.push_str(&n.node_value);
        }
        Ok(())
    })?;

    Ok(text)
}

/// Fully-qualified path selector for a node, e.g. `html > :nth-child(2) > :nth-child(1)`.
///
/// Text and comment nodes resolve to their parent element. Detached
/// subtrees start at their own topmost element's tag name.
pub fn path_selector(arena: &DomArena, node_id: NodeId) -> Result<String> {
    let mut current = node_id;
    loop {
        let node = arena.get(current)?;
        if node.is_element() {
            break;
        }
        match node.parent_id {
            Some(parent_id) => current = parent_id,
            None => return Ok(String::new()),
        }
    }

    let mut segments = Vec::new();
    loop {
        let node = arena.get(current)?;
        let parent = match node.parent_id {
            Some(parent_id) => arena.get(parent_id)?,
            None => {
                segments.push(node.node_name.clone());
                break;
            }
        };
        if !parent.is_element() {
            segments.push(node.node_name.clone());
            break;
        }
        let index = arena
            .element_children(parent.node_id)?
            .iter()
            .position(|&id| id == current)
            .map(|i| i + 1)
            .unwrap_or(1);
        segments.push(format!(":nth-child({})", index));
        current = parent.node_id;
    }

    segments.reverse();
    Ok(segments.join(" > "))
}

/// Parse a `style="a: b; c: d"` attribute into ordered declarations
pub fn parse_style_attr(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|declaration| {
            let (name, value) = declaration.split_once(':')?;
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().trim_end_matches("!important").trim();
            (!name.is_empty()).then(|| (name, value.to_string()))
        })
        .collect()
}

/// Serialize declarations back into a `style` attribute value
pub fn format_style_attr(declarations: &[(String, String)]) -> String {
    declarations
        .iter()
        .map(|(name, value)| format!("{}: {};", name, value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inline style property of an element (last declaration wins)
pub fn style_property(arena: &DomArena, node_id: NodeId, property: &str) -> Result<Option<String>> {
    let node = arena.get(node_id)?;
    let Some(style) = node.attr("style") else {
        return Ok(None);
    };
    Ok(parse_style_attr(style)
        .into_iter()
        .rev()
        .find(|(name, _)| name.eq_ignore_ascii_case(property))
        .map(|(_, value)| value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DomNode;

    #[test]
    fn test_cap_text_length_char_boundary() {
        assert_eq!(cap_text_length("short", 10), "short");
        assert_eq!(cap_text_length("héllo", 2), "h...");
    }

    #[test]
    fn test_path_selector() {
        let mut arena = DomArena::new();
        let doc = arena.add_node(DomNode::new(0, NodeType::Document, "#document"));
        let html = arena.add_node(DomNode::element(0, "html"));
        let head = arena.add_node(DomNode::element(0, "head"));
        let body = arena.add_node(DomNode::element(0, "body"));
        let text = arena.add_node(DomNode::text(0, "ignored"));
        let p = arena.add_node(DomNode::element(0, "p"));
        arena.append_child(doc, html).unwrap();
        arena.append_child(html, head).unwrap();
        arena.append_child(html, body).unwrap();
        arena.append_child(body, text).unwrap();
        arena.append_child(body, p).unwrap();
        arena.set_root(doc).unwrap();

        assert_eq!(path_selector(&arena, html).unwrap(), "html");
        assert_eq!(
            path_selector(&arena, p).unwrap(),
            "html > :nth-child(2) > :nth-child(1)"
        );
        assert_eq!(path_selector(&arena, text).unwrap(), "html > :nth-child(2)");
        assert_eq!(path_selector(&arena, doc).unwrap(), "");
    }

    #[test]
    fn test_style_attr() {
        let decls = parse_style_attr("color: red; DISPLAY:none !important;;bad");
        assert_eq!(
            decls,
            vec![
                ("color".to_string(), "red".to_string()),
                ("display".to_string(), "none".to_string())
            ]
        );
        assert_eq!(format_style_attr(&decls), "color: red; display: none;");
    }
}
