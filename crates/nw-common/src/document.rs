//! The result document a run of probes writes into.
//!
//! One document is built per run, entirely on the worker thread. Probes
//! navigate it through [`NodePath`] values: a path addresses a node by a
//! sequence of object keys and array indexes, and missing intermediate
//! nodes are created on assignment. Paths are plain data, so a probe can
//! hold several of them without borrowing the tree.
//!
//! Objects preserve insertion order so serialization is reproducible for a
//! fixed probe set: running the same probes against the same inputs always
//! produces the same bytes.
//!
//! The document also carries the run's error side-channel: appending an
//! error bumps `error_count` and `max_error_priority`, which the reporting
//! gate reads at the end of the run.

use crate::error::{Error, Result};
use crate::Priority;
use tracing::error;

/// Array index sentinel meaning "push a new element at the end".
///
/// `doc.set(&path.at(APPEND), v)` appends; [`Document::push`] resolves the
/// sentinel once and hands back a path with the concrete index so several
/// fields can be written into the same new element.
pub const APPEND: usize = usize::MAX;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A JSON-shaped value.
///
/// Objects are vectors of `(key, value)` pairs rather than maps: documents
/// are small, keys are written once, and insertion order is part of the
/// serialization contract.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

impl Value {
    /// New empty object.
    pub fn object() -> Self {
        Value::Object(Vec::new())
    }

    /// Returns the object entry for `key`, if this is an object.
    pub fn get_key(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Returns the array element at `index`, if this is an array.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Array(items) => items.get(index),
            _ => None,
        }
    }

    /// Number of keys (objects) or elements (arrays); 0 for scalars.
    pub fn len(&self) -> usize {
        match self {
            Value::Object(entries) => entries.len(),
            Value::Array(items) => items.len(),
            _ => 0,
        }
    }

    /// True when an object or array holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Entry for `key`, created as `Null` if absent. Replaces a non-object
    /// node with an empty object first.
    fn entry_mut(&mut self, key: &str) -> &mut Value {
        if !matches!(self, Value::Object(_)) {
            *self = Value::object();
        }
        let Value::Object(entries) = self else {
            unreachable!("just coerced to object");
        };
        if let Some(pos) = entries.iter().position(|(k, _)| k == key) {
            return &mut entries[pos].1;
        }
        entries.push((key.to_string(), Value::Null));
        &mut entries.last_mut().expect("just pushed").1
    }

    /// Element at `index`, growing the array with `Null` as needed.
    /// `APPEND` pushes one new element. Replaces a non-array node with an
    /// empty array first.
    fn element_mut(&mut self, index: usize) -> &mut Value {
        if !matches!(self, Value::Array(_)) {
            *self = Value::Array(Vec::new());
        }
        let Value::Array(items) = self else {
            unreachable!("just coerced to array");
        };
        if index == APPEND {
            items.push(Value::Null);
            return items.last_mut().expect("just pushed");
        }
        while items.len() <= index {
            items.push(Value::Null);
        }
        &mut items[index]
    }

    fn write_json(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(true) => out.push_str("true"),
            Value::Bool(false) => out.push_str("false"),
            Value::Int(n) => {
                out.push_str(&n.to_string());
            }
            Value::Float(f) => {
                // NaN and infinities have no JSON representation.
                if f.is_finite() {
                    out.push_str(&f.to_string());
                } else {
                    out.push_str("null");
                }
            }
            Value::Str(s) => write_json_string(s, out),
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_json(out);
                }
                out.push(']');
            }
            Value::Object(entries) => {
                out.push('{');
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_json_string(key, out);
                    out.push(':');
                    value.write_json(out);
                }
                out.push('}');
            }
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        // persisted figures fit i64 in practice; saturate rather than wrap
        Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

// ---------------------------------------------------------------------------
// NodePath
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

/// Address of a node inside a [`Document`].
///
/// Paths are cheap to clone and independent of the tree; they only resolve
/// when passed to a `Document` method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodePath {
    steps: Vec<Step>,
}

impl NodePath {
    /// The document root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Path to the object field `key` under this node.
    pub fn key(&self, key: &str) -> Self {
        let mut steps = self.steps.clone();
        steps.push(Step::Key(key.to_string()));
        Self { steps }
    }

    /// Path to the array element `index` under this node.
    /// [`APPEND`] addresses a new element pushed at resolution time.
    pub fn at(&self, index: usize) -> Self {
        let mut steps = self.steps.clone();
        steps.push(Step::Index(index));
        Self { steps }
    }

    /// True for the document root.
    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "$");
        }
        write!(f, "$")?;
        for step in &self.steps {
            match step {
                Step::Key(k) => write!(f, ".{k}")?,
                Step::Index(i) if *i == APPEND => write!(f, "[+]")?,
                Step::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// The in-memory result of one run.
///
/// The root is always an object. Besides the value tree the document
/// carries the run counters the reporting gate consumes: how many errors
/// probes appended and the highest priority among them.
#[derive(Debug, Clone)]
pub struct Document {
    root: Value,
    error_count: u32,
    max_error_priority: Priority,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// New document with an empty object root and cleared counters.
    pub fn new() -> Self {
        Self {
            root: Value::object(),
            error_count: 0,
            max_error_priority: 0,
        }
    }

    /// Mutable node at `path`, creating missing intermediates.
    ///
    /// An [`APPEND`] step pushes a new element every time it resolves, so
    /// callers that need to write several fields into one appended element
    /// should use [`Document::push`] instead.
    pub fn node_mut(&mut self, path: &NodePath) -> &mut Value {
        let mut node = &mut self.root;
        for step in &path.steps {
            node = match step {
                Step::Key(k) => node.entry_mut(k),
                Step::Index(i) => node.element_mut(*i),
            };
        }
        node
    }

    /// Node at `path`, without creating anything.
    pub fn get(&self, path: &NodePath) -> Option<&Value> {
        let mut node = &self.root;
        for step in &path.steps {
            node = match step {
                Step::Key(k) => node.get_key(k)?,
                Step::Index(i) => node.get_index(*i)?,
            };
        }
        Some(node)
    }

    /// Replace the node at `path` with `value`.
    pub fn set(&mut self, path: &NodePath, value: impl Into<Value>) {
        *self.node_mut(path) = value.into();
    }

    /// Push a new empty object onto the array at `path` (created if
    /// missing) and return the path of the new element.
    pub fn push(&mut self, path: &NodePath) -> NodePath {
        let node = self.node_mut(path);
        if !matches!(node, Value::Array(_)) {
            *node = Value::Array(Vec::new());
        }
        let Value::Array(items) = node else {
            unreachable!("just coerced to array");
        };
        items.push(Value::object());
        path.at(items.len() - 1)
    }

    /// Number of keys in the root object.
    pub fn root_len(&self) -> usize {
        self.root.len()
    }

    /// Reset the run counters. Called exactly once per run before any
    /// probe executes.
    pub fn clear_errors(&mut self) {
        self.error_count = 0;
        self.max_error_priority = 0;
    }

    /// Append an error entry to the `error` array under `at`.
    ///
    /// The entry records the producing probe, the message, and the
    /// priority; the document counters are updated accordingly. A priority
    /// outside `[0, 100]` fails with `InvalidPriority` and leaves the
    /// document untouched.
    pub fn append_error(
        &mut self,
        at: &NodePath,
        producer: &str,
        message: &str,
        priority: Priority,
    ) -> Result<()> {
        if !(0..=100).contains(&priority) {
            return Err(Error::InvalidPriority(priority));
        }

        // keep a trace of every detected issue in the log as well
        let flat = message.replace('\n', " -- ");
        error!(probe = producer, priority, "{flat}");

        self.error_count += 1;
        if priority > self.max_error_priority {
            self.max_error_priority = priority;
        }

        let entry = self.push(&at.key("error"));
        self.set(&entry.key("plugin_name"), producer);
        self.set(&entry.key("message"), message);
        self.set(&entry.key("priority"), priority);
        Ok(())
    }

    /// Number of errors appended this run.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Highest priority among the errors appended this run.
    pub fn max_error_priority(&self) -> Priority {
        self.max_error_priority
    }

    /// Serialize to JSON.
    ///
    /// Deterministic for a fixed sequence of mutations: object keys keep
    /// insertion order, floats use the shortest representation that
    /// round-trips, integers are 64-bit signed.
    pub fn to_json(&self) -> String {
        let mut out = String::with_capacity(256);
        self.root.write_json(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_scalars() {
        let mut doc = Document::new();
        let root = NodePath::root();
        doc.set(&root.key("start_date"), 1_700_000_000_i64);
        doc.set(&root.key("cpu").key("count"), 8);
        doc.set(&root.key("cpu").key("avg1"), 0.25);
        doc.set(&root.key("cpu").key("warning"), "High CPU usage");

        assert_eq!(
            doc.get(&root.key("cpu").key("count")).and_then(Value::as_i64),
            Some(8)
        );
        assert_eq!(
            doc.get(&root.key("cpu").key("warning")).and_then(Value::as_str),
            Some("High CPU usage")
        );
        assert_eq!(doc.root_len(), 2);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut doc = Document::new();
        let root = NodePath::root();
        doc.set(&root.key("zebra"), 1);
        doc.set(&root.key("apple"), 2);
        doc.set(&root.key("mango"), 3);
        assert_eq!(doc.to_json(), r#"{"zebra":1,"apple":2,"mango":3}"#);
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let mut doc = Document::new();
        let root = NodePath::root();
        doc.set(&root.key("a"), 1);
        doc.set(&root.key("b"), 2);
        doc.set(&root.key("a"), 9);
        assert_eq!(doc.to_json(), r#"{"a":9,"b":2}"#);
    }

    #[test]
    fn test_push_returns_concrete_index() {
        let mut doc = Document::new();
        let procs = NodePath::root().key("process");
        let first = doc.push(&procs);
        doc.set(&first.key("name"), "clusterd");
        doc.set(&first.key("pcpu"), 0.5);
        let second = doc.push(&procs);
        doc.set(&second.key("name"), "fwwatch");

        assert_eq!(
            doc.to_json(),
            r#"{"process":[{"name":"clusterd","pcpu":0.5},{"name":"fwwatch"}]}"#
        );
    }

    #[test]
    fn test_append_sentinel_pushes_each_time() {
        let mut doc = Document::new();
        let tags = NodePath::root().key("tags");
        doc.set(&tags.at(APPEND), "one");
        doc.set(&tags.at(APPEND), "two");
        assert_eq!(doc.to_json(), r#"{"tags":["one","two"]}"#);
    }

    #[test]
    fn test_index_grows_with_nulls() {
        let mut doc = Document::new();
        let arr = NodePath::root().key("a");
        doc.set(&arr.at(2), 7);
        assert_eq!(doc.to_json(), r#"{"a":[null,null,7]}"#);
    }

    #[test]
    fn test_append_error_updates_counters() {
        let mut doc = Document::new();
        let root = NodePath::root();
        doc.clear_errors();
        doc.append_error(&root, "cpu", "High CPU usage.", 100).unwrap();
        doc.append_error(&root.key("memory"), "memory", "High swap usage", 65)
            .unwrap();

        assert_eq!(doc.error_count(), 2);
        assert_eq!(doc.max_error_priority(), 100);

        let entry = doc
            .get(&root.key("error").at(0))
            .expect("first root error entry");
        assert_eq!(entry.get_key("plugin_name").and_then(Value::as_str), Some("cpu"));
        assert_eq!(entry.get_key("priority").and_then(Value::as_i64), Some(100));

        let nested = doc
            .get(&root.key("memory").key("error").at(0))
            .expect("nested error entry");
        assert_eq!(
            nested.get_key("message").and_then(Value::as_str),
            Some("High swap usage")
        );
    }

    #[test]
    fn test_append_error_rejects_out_of_range() {
        let mut doc = Document::new();
        let root = NodePath::root();
        let before = doc.to_json();

        let err = doc.append_error(&root, "cpu", "boom", 101).unwrap_err();
        assert!(matches!(err, Error::InvalidPriority(101)));
        let err = doc.append_error(&root, "cpu", "boom", -1).unwrap_err();
        assert!(matches!(err, Error::InvalidPriority(-1)));

        // no mutation on rejection
        assert_eq!(doc.to_json(), before);
        assert_eq!(doc.error_count(), 0);
        assert_eq!(doc.max_error_priority(), 0);
    }

    #[test]
    fn test_clear_errors_resets_counters() {
        let mut doc = Document::new();
        doc.append_error(&NodePath::root(), "disk", "full", 55).unwrap();
        doc.clear_errors();
        assert_eq!(doc.error_count(), 0);
        assert_eq!(doc.max_error_priority(), 0);
    }

    #[test]
    fn test_string_escaping() {
        let mut doc = Document::new();
        doc.set(
            &NodePath::root().key("msg"),
            "line1\nline2\t\"quoted\" \\ \u{1}",
        );
        assert_eq!(
            doc.to_json(),
            r#"{"msg":"line1\nline2\t\"quoted\" \\ \u0001"}"#
        );
    }

    #[test]
    fn test_non_finite_floats_become_null() {
        let mut doc = Document::new();
        doc.set(&NodePath::root().key("bad"), f64::NAN);
        doc.set(&NodePath::root().key("inf"), f64::INFINITY);
        assert_eq!(doc.to_json(), r#"{"bad":null,"inf":null}"#);
    }

    #[test]
    fn test_serialization_deterministic() {
        let build = || {
            let mut doc = Document::new();
            let root = NodePath::root();
            doc.set(&root.key("start_date"), 1_700_000_000_i64);
            let e = doc.push(&root.key("disk").key("partition"));
            doc.set(&e.key("dir"), "/");
            doc.set(&e.key("blocks"), 52_403_200_u64);
            doc.append_error(&root.key("disk"), "disk", "partition close to full", 80)
                .unwrap();
            doc.set(&root.key("end_date"), 1_700_000_001_i64);
            doc.to_json()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_path_display() {
        let p = NodePath::root().key("disk").key("partition").at(0).key("dir");
        assert_eq!(p.to_string(), "$.disk.partition[0].dir");
        assert_eq!(NodePath::root().to_string(), "$");
    }
}
