//! XML notice → search document normalization.
//!
//! Every element becomes a field named after its local name (namespace
//! prefixes are stripped, so `ted:Foo` and `Foo` share a field). Within one
//! element the body is built in a fixed order:
//!
//! 1. attributes (namespace declarations excluded)
//! 2. leading text, trimmed, under [`TEXT_KEY`] when non-empty
//! 3. children; a repeated tag turns into a list in encounter order, and a
//!    child overwrites an attribute of the same name
//!
//! The root element's own name is not stored: its body is the document body,
//! to which [`FILENAME_KEY`] and [`FILEPATH_KEY`] are appended.
//!
//! Traversal uses an explicit stack bounded by [`MAX_ELEMENT_DEPTH`].

use std::collections::HashSet;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};
use tracing::instrument;

use tedsync_shared::{Document, Result, TedSyncError};

/// Field holding an element's trimmed leading text.
pub const TEXT_KEY: &str = "text";

/// Reserved field holding the source file's base name.
pub const FILENAME_KEY: &str = "_filename";

/// Reserved field holding the source file's full path.
pub const FILEPATH_KEY: &str = "_filepath";

/// Deepest element nesting accepted before the file is rejected.
pub const MAX_ELEMENT_DEPTH: usize = 512;

/// Read and normalize one XML file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub fn normalize(path: &Path) -> Result<Document> {
    let bytes = std::fs::read(path).map_err(|e| TedSyncError::io(path, e))?;
    normalize_bytes(&bytes, path)
}

/// Normalize in-memory XML as if it had been read from `path`.
pub fn normalize_bytes(xml: &[u8], path: &Path) -> Result<Document> {
    let mut body = parse_tree(xml)
        .map_err(|e| TedSyncError::format(format!("{}: {e}", path.display())))?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    body.insert(FILENAME_KEY.into(), Value::String(filename));
    body.insert(
        FILEPATH_KEY.into(),
        Value::String(path.to_string_lossy().into_owned()),
    );

    Ok(Document {
        id: document_id(path),
        body,
    })
}

/// Document id: the file name without its final extension.
pub fn document_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tree building
// ---------------------------------------------------------------------------

/// An element still open on the traversal stack.
struct Frame {
    name: String,
    body: Map<String, Value>,
    /// Keys written by child elements (as opposed to attributes or text).
    child_keys: HashSet<String>,
    text: String,
    has_children: bool,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> std::result::Result<Self, String> {
        let name = std::str::from_utf8(start.local_name().as_ref())
            .map_err(|e| format!("invalid tag name: {e}"))?
            .to_string();

        let mut body = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| format!("bad attribute on <{name}>: {e}"))?;
            let key = attr.key.as_ref();
            if key == b"xmlns" || key.starts_with(b"xmlns:") {
                continue;
            }
            let key = std::str::from_utf8(key)
                .map_err(|e| format!("invalid attribute name on <{name}>: {e}"))?
                .to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| format!("bad value for attribute {key} on <{name}>: {e}"))?;
            body.insert(key, Value::String(value.into_owned()));
        }

        Ok(Self {
            name,
            body,
            child_keys: HashSet::new(),
            text: String::new(),
            has_children: false,
        })
    }

    fn push_text(&mut self, text: &str) {
        // Only the text before the first child counts
        if !self.has_children {
            self.text.push_str(text);
        }
    }

    fn flush_text(&mut self) {
        let trimmed = self.text.trim();
        if !trimmed.is_empty() {
            self.body
                .insert(TEXT_KEY.into(), Value::String(trimmed.to_string()));
        }
        self.text.clear();
    }

    fn add_child(&mut self, name: String, value: Value) {
        if !self.child_keys.contains(&name) {
            self.body.insert(name.clone(), value);
            self.child_keys.insert(name);
            return;
        }
        match self.body.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                self.body.insert(name, value);
            }
        }
    }

    fn close(mut self) -> (String, Map<String, Value>) {
        if !self.has_children {
            self.flush_text();
        }
        (self.name, self.body)
    }
}

fn open_element(
    stack: &mut Vec<Frame>,
    root: &Option<Map<String, Value>>,
    start: &BytesStart<'_>,
) -> std::result::Result<(), String> {
    if stack.is_empty() && root.is_some() {
        return Err("junk after document element".into());
    }
    if stack.len() >= MAX_ELEMENT_DEPTH {
        return Err(format!(
            "element nesting exceeds {MAX_ELEMENT_DEPTH} levels"
        ));
    }
    if let Some(parent) = stack.last_mut() {
        if !parent.has_children {
            parent.flush_text();
            parent.has_children = true;
        }
    }
    stack.push(Frame::open(start)?);
    Ok(())
}

fn close_element(
    stack: &mut Vec<Frame>,
    root: &mut Option<Map<String, Value>>,
) -> std::result::Result<(), String> {
    let frame = stack
        .pop()
        .ok_or_else(|| "closing tag without matching opening tag".to_string())?;
    let (name, body) = frame.close();
    match stack.last_mut() {
        Some(parent) => parent.add_child(name, Value::Object(body)),
        None => *root = Some(body),
    }
    Ok(())
}

fn push_text(stack: &mut [Frame], text: &str) -> std::result::Result<(), String> {
    match stack.last_mut() {
        Some(frame) => {
            frame.push_text(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err("text outside the document element".into()),
    }
}

/// Parse `xml` into the root element's body.
fn parse_tree(xml: &[u8]) -> std::result::Result<Map<String, Value>, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<Map<String, Value>> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| format!("at byte {}: {e}", reader.buffer_position()))?;

        match event {
            Event::Start(start) => open_element(&mut stack, &root, &start)?,
            Event::Empty(start) => {
                open_element(&mut stack, &root, &start)?;
                close_element(&mut stack, &mut root)?;
            }
            Event::End(_) => close_element(&mut stack, &mut root)?,
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| format!("bad text content: {e}"))?;
                push_text(&mut stack, &text)?;
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                push_text(&mut stack, &text)?;
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions, doctype
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(format!("unexpected end of document inside <{}>", open.name));
    }
    root.ok_or_else(|| "no document element".to_string())
}
