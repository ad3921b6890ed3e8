//! CSS selector engine
//!
//! Supports the subset page scripts actually use:
//! type / universal / `#id` / `.class`, attribute conditions
//! (`=`, `^=`, `$=`, `*=`, `~=`, `|=`), structural pseudo-classes,
//! `:not(...)`, the four combinators and comma-separated groups.
//!
//! Matching runs right-to-left from the candidate element.

use crate::arena::DomArena;
use crate::error::{DomError, Result};
use crate::types::{DomNode, NodeId, NodeType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrCondition {
    Exists { key: String },
    Eq { key: String, value: String },
    StartsWith { key: String, value: String },
    EndsWith { key: String, value: String },
    Contains { key: String, value: String },
    Includes { key: String, value: String },
    DashMatch { key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NthChild {
    Odd,
    Even,
    /// `an+b`; a plain integer is `0n+b`
    AnPlusB(i64, i64),
}

impl NthChild {
    /// `index` is 1-based
    fn matches(&self, index: usize) -> bool {
        let index = index as i64;
        match *self {
            NthChild::Odd => index % 2 == 1,
            NthChild::Even => index % 2 == 0,
            NthChild::AnPlusB(0, b) => index == b,
            NthChild::AnPlusB(a, b) => {
                let diff = index - b;
                diff % a == 0 && diff / a >= 0
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PseudoClass {
    Root,
    FirstChild,
    LastChild,
    OnlyChild,
    Empty,
    Checked,
    Disabled,
    NthChild(NthChild),
    NthLastChild(NthChild),
    Not(Vec<Compound>),
}

/// One compound selector, e.g. `div.item[data-x]:first-child`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compound {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attrs: Vec<AttrCondition>,
    pub pseudo_classes: Vec<PseudoClass>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    Descendant,
    Child,
    AdjacentSibling,
    GeneralSibling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub compound: Compound,
    /// Relation to the part on the left
    pub combinator: Option<Combinator>,
}

/// A parsed selector list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    groups: Vec<Vec<Part>>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = Parser::new(source);
        let groups = parser.selector_list()?;
        Ok(Self { groups })
    }

    pub fn matches(&self, arena: &DomArena, node_id: NodeId) -> bool {
        match arena.get(node_id) {
            Ok(node) if node.is_element() => self
                .groups
                .iter()
                .any(|parts| matches_parts(arena, node, parts)),
            _ => false,
        }
    }

    /// Descendant elements of `scope` matching this selector, in document order
    pub fn query_all(&self, arena: &DomArena, scope: NodeId) -> Result<Vec<NodeId>> {
        Ok(arena
            .descendant_elements(scope)?
            .into_iter()
            .filter(|&id| self.matches(arena, id))
            .collect())
    }

    pub fn query(&self, arena: &DomArena, scope: NodeId) -> Result<Option<NodeId>> {
        Ok(arena
            .descendant_elements(scope)?
            .into_iter()
            .find(|&id| self.matches(arena, id)))
    }
}

fn matches_parts(arena: &DomArena, node: &DomNode, parts: &[Part]) -> bool {
    let Some((last, rest)) = parts.split_last() else {
        return false;
    };
    if !matches_compound(arena, node, &last.compound) {
        return false;
    }
    if rest.is_empty() {
        return true;
    }

    match last.combinator.unwrap_or(Combinator::Descendant) {
        Combinator::Descendant => {
            let mut current = parent_element(arena, node);
            while let Some(ancestor) = current {
                if matches_parts(arena, ancestor, rest) {
                    return true;
                }
                current = parent_element(arena, ancestor);
            }
            false
        }
        Combinator::Child => parent_element(arena, node)
            .map(|parent| matches_parts(arena, parent, rest))
            .unwrap_or(false),
        Combinator::AdjacentSibling => {
            let siblings = element_siblings(arena, node);
            let position = siblings.iter().position(|n| n.node_id == node.node_id);
            match position {
                Some(i) if i > 0 => matches_parts(arena, siblings[i - 1], rest),
                _ => false,
            }
        }
        Combinator::GeneralSibling => element_siblings(arena, node)
            .into_iter()
            .take_while(|n| n.node_id != node.node_id)
            .any(|sibling| matches_parts(arena, sibling, rest)),
    }
}

fn matches_compound(arena: &DomArena, node: &DomNode, compound: &Compound) -> bool {
    if let Some(tag) = &compound.tag {
        if !node.is_tag(tag) {
            return false;
        }
    }
    if let Some(id) = &compound.id {
        if node.attr("id") != Some(id.as_str()) {
            return false;
        }
    }
    if !compound
        .classes
        .iter()
        .all(|class| node.classes().any(|c| c == class))
    {
        return false;
    }
    if !compound.attrs.iter().all(|cond| matches_attr(node, cond)) {
        return false;
    }
    compound
        .pseudo_classes
        .iter()
        .all(|pseudo| matches_pseudo(arena, node, pseudo))
}

fn matches_attr(node: &DomNode, cond: &AttrCondition) -> bool {
    match cond {
        AttrCondition::Exists { key } => node.attributes.contains(key),
        AttrCondition::Eq { key, value } => node.attr(key) == Some(value.as_str()),
        AttrCondition::StartsWith { key, value } => node
            .attr(key)
            .map(|v| !value.is_empty() && v.starts_with(value.as_str()))
            .unwrap_or(false),
        AttrCondition::EndsWith { key, value } => node
            .attr(key)
            .map(|v| !value.is_empty() && v.ends_with(value.as_str()))
            .unwrap_or(false),
        AttrCondition::Contains { key, value } => node
            .attr(key)
            .map(|v| !value.is_empty() && v.contains(value.as_str()))
            .unwrap_or(false),
        AttrCondition::Includes { key, value } => node
            .attr(key)
            .map(|v| v.split_ascii_whitespace().any(|w| w == value))
            .unwrap_or(false),
        AttrCondition::DashMatch { key, value } => node
            .attr(key)
            .map(|v| v == value || v.starts_with(&format!("{}-", value)))
            .unwrap_or(false),
    }
}

fn matches_pseudo(arena: &DomArena, node: &DomNode, pseudo: &PseudoClass) -> bool {
    match pseudo {
        PseudoClass::Root => node
            .parent_id
            .and_then(|id| arena.get(id).ok())
            .map(|parent| parent.node_type == NodeType::Document)
            .unwrap_or(false),
        PseudoClass::Empty => node.children_ids.iter().all(|&id| {
            arena
                .get(id)
                .map(|child| {
                    (child.is_text() && child.node_value.is_empty())
                        || child.node_type == NodeType::Comment
                })
                .unwrap_or(true)
        }),
        PseudoClass::Checked => node.attributes.contains("checked") || node.attributes.contains("selected"),
        PseudoClass::Disabled => node.attributes.contains("disabled"),
        PseudoClass::Not(inner) => !inner.iter().any(|c| matches_compound(arena, node, c)),
        structural => {
            if node.parent_id.is_none() {
                return false;
            }
            let siblings = element_siblings(arena, node);
            let Some(position) = siblings.iter().position(|n| n.node_id == node.node_id) else {
                return false;
            };
            let count = siblings.len();
            match structural {
                PseudoClass::FirstChild => position == 0,
                PseudoClass::LastChild => position + 1 == count,
                PseudoClass::OnlyChild => count == 1,
                PseudoClass::NthChild(nth) => nth.matches(position + 1),
                PseudoClass::NthLastChild(nth) => nth.matches(count - position),
                _ => false,
            }
        }
    }
}

fn parent_element<'a>(arena: &'a DomArena, node: &DomNode) -> Option<&'a DomNode> {
    let parent = arena.get(node.parent_id?).ok()?;
    parent.is_element().then_some(parent)
}

fn element_siblings<'a>(arena: &'a DomArena, node: &DomNode) -> Vec<&'a DomNode> {
    let Some(parent_id) = node.parent_id else {
        return Vec::new();
    };
    arena
        .children(parent_id)
        .map(|children| children.into_iter().filter(|n| n.is_element()).collect())
        .unwrap_or_default()
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self) -> DomError {
        DomError::InvalidSelector(self.source.to_string())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn expect(&mut self, ch: char) -> Result<()> {
        if self.bump() == Some(ch) {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
        self.pos != start
    }

    fn selector_list(&mut self) -> Result<Vec<Vec<Part>>> {
        let mut groups = Vec::new();
        loop {
            self.skip_whitespace();
            groups.push(self.complex()?);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                None => break,
                Some(_) => return Err(self.error()),
            }
        }
        Ok(groups)
    }

    fn complex(&mut self) -> Result<Vec<Part>> {
        let mut parts = vec![Part {
            compound: self.compound()?,
            combinator: None,
        }];

        loop {
            let had_space = self.skip_whitespace();
            let combinator = match self.peek() {
                Some('>') => Combinator::Child,
                Some('+') => Combinator::AdjacentSibling,
                Some('~') => Combinator::GeneralSibling,
                Some(',') | None => break,
                Some(_) if had_space => Combinator::Descendant,
                Some(_) => return Err(self.error()),
            };
            if combinator != Combinator::Descendant {
                self.pos += 1;
                self.skip_whitespace();
            }
            parts.push(Part {
                compound: self.compound()?,
                combinator: Some(combinator),
            });
        }

        Ok(parts)
    }

    fn compound(&mut self) -> Result<Compound> {
        let mut compound = Compound::default();
        let mut empty = true;

        match self.peek() {
            Some('*') => {
                self.pos += 1;
                empty = false;
            }
            Some(ch) if is_ident_start(ch) => {
                compound.tag = Some(self.ident()?.to_ascii_lowercase());
                empty = false;
            }
            _ => {}
        }

        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.id = Some(self.ident()?);
                }
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attrs.push(self.attribute()?);
                }
                Some(':') => {
                    self.pos += 1;
                    compound.pseudo_classes.push(self.pseudo()?);
                }
                _ => break,
            }
            empty = false;
        }

        if empty {
            return Err(self.error());
        }
        Ok(compound)
    }

    fn ident(&mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(ch) = self.peek() {
            if ch == '\\' {
                self.pos += 1;
                out.push(self.bump().ok_or_else(|| self.error())?);
            } else if is_ident_char(ch) {
                out.push(ch);
                self.pos += 1;
            } else {
                break;
            }
        }
        if out.is_empty() {
            return Err(self.error());
        }
        Ok(out)
    }

    fn attribute(&mut self) -> Result<AttrCondition> {
        self.skip_whitespace();
        let key = self.ident()?.to_ascii_lowercase();
        self.skip_whitespace();

        let op = match self.bump() {
            Some(']') => return Ok(AttrCondition::Exists { key }),
            Some('=') => '=',
            Some(op @ ('^' | '$' | '*' | '~' | '|')) => {
                self.expect('=')?;
                op
            }
            _ => return Err(self.error()),
        };

        self.skip_whitespace();
        let value = match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let mut value = String::new();
                loop {
                    match self.bump() {
                        Some('\\') => value.push(self.bump().ok_or_else(|| self.error())?),
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                        None => return Err(self.error()),
                    }
                }
                value
            }
            _ => self.ident()?,
        };
        self.skip_whitespace();
        // Case-sensitivity flags are accepted and ignored
        if matches!(self.peek(), Some('i' | 'I' | 's' | 'S')) {
            self.pos += 1;
            self.skip_whitespace();
        }
        self.expect(']')?;

        Ok(match op {
            '=' => AttrCondition::Eq { key, value },
            '^' => AttrCondition::StartsWith { key, value },
            '$' => AttrCondition::EndsWith { key, value },
            '*' => AttrCondition::Contains { key, value },
            '~' => AttrCondition::Includes { key, value },
            _ => AttrCondition::DashMatch { key, value },
        })
    }

    fn pseudo(&mut self) -> Result<PseudoClass> {
        let name = self.ident()?.to_ascii_lowercase();
        let pseudo = match name.as_str() {
            "root" => PseudoClass::Root,
            "first-child" => PseudoClass::FirstChild,
            "last-child" => PseudoClass::LastChild,
            "only-child" => PseudoClass::OnlyChild,
            "empty" => PseudoClass::Empty,
            "checked" => PseudoClass::Checked,
            "disabled" => PseudoClass::Disabled,
            "nth-child" | "nth-last-child" => {
                let argument = self.parenthesized()?;
                let nth = parse_nth(&argument).ok_or_else(|| self.error())?;
                if name == "nth-child" {
                    PseudoClass::NthChild(nth)
                } else {
                    PseudoClass::NthLastChild(nth)
                }
            }
            "not" => {
                self.expect('(')?;
                let mut inner = Vec::new();
                loop {
                    self.skip_whitespace();
                    inner.push(self.compound()?);
                    self.skip_whitespace();
                    match self.bump() {
                        Some(',') => continue,
                        Some(')') => break,
                        _ => return Err(self.error()),
                    }
                }
                PseudoClass::Not(inner)
            }
            _ => return Err(self.error()),
        };
        Ok(pseudo)
    }

    fn parenthesized(&mut self) -> Result<String> {
        self.expect('(')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(')') => break,
                Some(ch) => out.push(ch),
                None => return Err(self.error()),
            }
        }
        Ok(out)
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '-' || !ch.is_ascii()
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || !ch.is_ascii()
}

fn parse_nth(argument: &str) -> Option<NthChild> {
    let compact: String = argument
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    match compact.as_str() {
        "odd" => return Some(NthChild::Odd),
        "even" => return Some(NthChild::Even),
        _ => {}
    }

    match compact.split_once('n') {
        None => compact.parse::<i64>().ok().map(|b| NthChild::AnPlusB(0, b)),
        Some((a, b)) => {
            let a = match a {
                "" | "+" => 1,
                "-" => -1,
                a => a.parse::<i64>().ok()?,
            };
            let b = if b.is_empty() {
                0
            } else {
                b.strip_prefix('+').unwrap_or(b).parse::<i64>().ok()?
            };
            Some(NthChild::AnPlusB(a, b))
        }
    }
}
