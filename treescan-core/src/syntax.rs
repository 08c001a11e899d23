//! Language-agnostic syntax tree encoding.
//!
//! A parsed tree-sitter tree is converted into a [`SyntaxNode`] tree holding
//! only structure: node kind, start/end positions and ordered children. The
//! JSON encoding of that tree is canonical, so identical sources always
//! produce identical bytes and therefore identical content hashes.

use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Zero-based (row, column) position, encoded as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(usize, usize)", into = "(usize, usize)")]
pub struct Position {
    pub row: usize,
    pub column: usize,
}

impl From<(usize, usize)> for Position {
    fn from((row, column): (usize, usize)) -> Self {
        Self { row, column }
    }
}

impl From<Position> for (usize, usize) {
    fn from(p: Position) -> Self {
        (p.row, p.column)
    }
}

impl From<tree_sitter::Point> for Position {
    fn from(p: tree_sitter::Point) -> Self {
        Self {
            row: p.row,
            column: p.column,
        }
    }
}

/// Trees nested deeper than this are rejected by the parse worker
pub const DEFAULT_MAX_TREE_DEPTH: usize = 100_000;

/// A tree exceeded the configured depth limit while being converted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("syntax tree is nested deeper than {limit} levels")]
pub struct TreeTooDeep {
    pub limit: usize,
}

/// One node of the serialized tree. Children are in source order.
///
/// Every traversal here (conversion, encoding, decoding and drop) keeps its
/// own stack, so tree depth never turns into call-stack depth.
#[derive(Debug, PartialEq, Eq)]
pub struct SyntaxNode {
    pub kind: String,
    pub start: Position,
    pub end: Position,
    pub children: Vec<SyntaxNode>,
}

impl Drop for SyntaxNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

impl SyntaxNode {
    fn leaf(node: tree_sitter::Node<'_>) -> Self {
        Self {
            kind: node.kind().to_string(),
            start: node.start_position().into(),
            end: node.end_position().into(),
            children: Vec::new(),
        }
    }

    /// Convert a tree-sitter node and all of its descendants (named and
    /// anonymous). The root counts as depth 1; anything nested deeper than
    /// `max_depth` is rejected.
    pub fn from_tree_sitter(root: tree_sitter::Node<'_>, max_depth: usize) -> Result<Self, TreeTooDeep> {
        let mut cursor = root.walk();
        let mut stack = vec![Self::leaf(root)];

        loop {
            if cursor.goto_first_child() {
                if stack.len() >= max_depth {
                    return Err(TreeTooDeep { limit: max_depth });
                }
                stack.push(Self::leaf(cursor.node()));
                continue;
            }
            // Current node is complete: attach it and move on.
            loop {
                if cursor.goto_next_sibling() {
                    attach_top(&mut stack);
                    stack.push(Self::leaf(cursor.node()));
                    break;
                }
                if !cursor.goto_parent() {
                    return Ok(stack.pop().unwrap_or_else(|| Self::leaf(root)));
                }
                attach_top(&mut stack);
            }
        }
    }

    /// Total number of nodes in this subtree
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(node.children.iter());
        }
        count
    }

    /// Depth of this subtree (a leaf has depth 1)
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut pending = vec![(self, 1usize)];
        while let Some((node, d)) = pending.pop() {
            max = max.max(d);
            pending.extend(node.children.iter().map(|c| (c, d + 1)));
        }
        max
    }

    /// Whether tree-sitter had to recover from a syntax error anywhere below
    pub fn has_error(&self) -> bool {
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            if node.kind == "ERROR" {
                return true;
            }
            pending.extend(node.children.iter());
        }
        false
    }
}

fn attach_top(stack: &mut Vec<SyntaxNode>) {
    if stack.len() < 2 {
        return;
    }
    if let Some(done) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(done);
        }
    }
}

/// Canonical byte encoding of a tree: compact JSON with the fields in the
/// order `type`, `start`, `end`, `children`.
pub fn encode(node: &SyntaxNode) -> crate::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    write_open(&mut out, node)?;
    // (node, index of the next child to write)
    let mut stack: Vec<(&SyntaxNode, usize)> = vec![(node, 0)];

    while let Some(top) = stack.last_mut() {
        let current: &SyntaxNode = top.0;
        match current.children.get(top.1) {
            Some(child) => {
                if top.1 > 0 {
                    out.push(b',');
                }
                top.1 += 1;
                write_open(&mut out, child)?;
                stack.push((child, 0));
            }
            None => {
                out.extend_from_slice(b"]}");
                stack.pop();
            }
        }
    }
    Ok(out)
}

/// Everything of a node up to and including the `[` opening its children
fn write_open(out: &mut Vec<u8>, node: &SyntaxNode) -> crate::Result<()> {
    out.extend_from_slice(br#"{"type":"#);
    serde_json::to_writer(&mut *out, &node.kind)?;
    write!(
        out,
        r#","start":[{},{}],"end":[{},{}],"children":["#,
        node.start.row, node.start.column, node.end.row, node.end.column
    )?;
    Ok(())
}

/// Decode bytes produced by [`encode`]. No nesting limit is applied.
pub fn decode(bytes: &[u8]) -> crate::Result<SyntaxNode> {
    let mut reader = Reader { bytes, pos: 0 };
    reader.expect(b'{')?;
    let mut open = vec![PartialNode::default()];
    let mut first_member = true;

    loop {
        if reader.eat(b'}') {
            let done = match open.pop() {
                Some(partial) => partial
                    .into_node()
                    .map_err(|field| reader.error(format_args!("missing field `{}`", field)))?,
                None => return Err(reader.error("unbalanced object")),
            };
            let Some(parent) = open.last_mut() else {
                reader.finish()?;
                return Ok(done);
            };
            parent.children.get_or_insert_with(Vec::new).push(done);
            // Next element of the parent's children array, or its end
            if reader.eat(b',') {
                reader.expect(b'{')?;
                open.push(PartialNode::default());
                first_member = true;
            } else {
                reader.expect(b']')?;
                first_member = false;
            }
            continue;
        }

        if !first_member {
            reader.expect(b',')?;
        }
        first_member = false;
        let key = reader.string()?;
        reader.expect(b':')?;
        let Some(node) = open.last_mut() else {
            return Err(reader.error("unbalanced object"));
        };

        let duplicate = match key.as_str() {
            "type" => node.kind.replace(reader.string()?).is_some(),
            "start" => node.start.replace(reader.position()?).is_some(),
            "end" => node.end.replace(reader.position()?).is_some(),
            "children" => {
                reader.expect(b'[')?;
                let seen = node.children.replace(Vec::new()).is_some();
                if !reader.eat(b']') {
                    reader.expect(b'{')?;
                    open.push(PartialNode::default());
                    first_member = true;
                }
                seen
            }
            other => return Err(reader.error(format_args!("unknown field `{}`", other))),
        };
        if duplicate {
            return Err(reader.error(format_args!("duplicate field `{}`", key)));
        }
    }
}

#[derive(Default)]
struct PartialNode {
    kind: Option<String>,
    start: Option<Position>,
    end: Option<Position>,
    children: Option<Vec<SyntaxNode>>,
}

impl PartialNode {
    fn into_node(self) -> Result<SyntaxNode, &'static str> {
        Ok(SyntaxNode {
            kind: self.kind.ok_or("type")?,
            start: self.start.ok_or("start")?,
            end: self.end.ok_or("end")?,
            children: self.children.ok_or("children")?,
        })
    }
}

/// Byte cursor over an encoded tree
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn error(&self, message: impl std::fmt::Display) -> ScanError {
        ScanError::Serialization(serde::de::Error::custom(format_args!(
            "{} at byte {}",
            message, self.pos
        )))
    }

    fn skip_ws(&mut self) {
        while let Some(b' ' | b'\n' | b'\r' | b'\t') = self.bytes.get(self.pos) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, byte: u8) -> bool {
        self.skip_ws();
        if self.bytes.get(self.pos) == Some(&byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> crate::Result<()> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.error(format_args!("expected `{}`", byte as char)))
        }
    }

    fn string(&mut self) -> crate::Result<String> {
        self.skip_ws();
        let start = self.pos;
        if self.bytes.get(start) != Some(&b'"') {
            return Err(self.error("expected string"));
        }
        let mut end = start + 1;
        loop {
            match self.bytes.get(end) {
                Some(b'"') => break,
                Some(b'\\') => end += 2,
                Some(_) => end += 1,
                None => return Err(self.error("unterminated string")),
            }
        }
        self.pos = end + 1;
        // Unescaping and UTF-8 validation of a single flat string
        Ok(serde_json::from_slice(&self.bytes[start..=end])?)
    }

    fn number(&mut self) -> crate::Result<usize> {
        self.skip_ws();
        let start = self.pos;
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| self.error("expected unsigned integer"))
    }

    fn position(&mut self) -> crate::Result<Position> {
        self.expect(b'[')?;
        let row = self.number()?;
        self.expect(b',')?;
        let column = self.number()?;
        self.expect(b']')?;
        Ok(Position { row, column })
    }

    fn finish(&mut self) -> crate::Result<()> {
        self.skip_ws();
        if self.pos != self.bytes.len() {
            return Err(self.error("trailing characters"));
        }
        Ok(())
    }
}
