//! Presentation-preserving JSON codec for component props and return values.
//!
//! The dashboard exchanges JSON bodies, but component props and handler
//! results may carry values JSON cannot express directly: dates, times,
//! sets, maps with ordered entries, regular expressions, explicit
//! `undefined`, and the non-finite floats. This module encodes such a value
//! tree into a JSON-compatible value plus a minimal annotation tree keyed by
//! escaped dotted paths, and decodes the pair back into the original tree.
//!
//! Date-like values round-trip as ISO-8601 with millisecond precision and a
//! trailing `Z`.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde_json::{Map as JsonMap, Number, Value, json};
use thiserror::Error;

/// Wire format for encoded timestamps.
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Path segments that may never be addressed by an annotation tree.
const DISALLOWED_SEGMENTS: [&str; 3] = ["__proto__", "prototype", "constructor"];

/// Errors produced while encoding or decoding payload trees.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// An annotation tree used a malformed or unknown tag.
    #[error("unknown annotation tag: {0}")]
    UnknownAnnotation(String),
    /// An annotation tree was not shaped like a tag tuple or path map.
    #[error("malformed annotation tree")]
    MalformedAnnotations,
    /// An annotation path did not resolve within the plain value.
    #[error("annotation path {0:?} does not exist in the value")]
    MissingPath(String),
    /// An annotation path used a segment that is never allowed.
    #[error("{0} is not allowed as a path segment")]
    DisallowedSegment(String),
    /// A value did not match the shape its annotation demands.
    #[error("cannot revive {tag} annotation from {found}")]
    MismatchedValue {
        /// The annotation tag being applied.
        tag: String,
        /// A short description of the value actually present.
        found: String,
    },
    /// A timestamp string failed to parse.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// A value tree as handlers see it, richer than plain JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON `null`.
    Null,
    /// An explicitly absent value, distinct from `null`.
    Undefined,
    /// Boolean.
    Bool(bool),
    /// Integer number.
    Int(i64),
    /// Floating-point number, including the non-finite values.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Calendar date without a time of day.
    Date(NaiveDate),
    /// Calendar timestamp without an offset; always transmitted as UTC.
    DateTime(NaiveDateTime),
    /// Wall-clock time of day.
    Time(NaiveTime),
    /// Regular expression source and flags.
    Regexp {
        /// The pattern source, without delimiters.
        pattern: String,
        /// Flag characters, e.g. `im`.
        flags: String,
    },
    /// Ordered sequence.
    Array(Vec<Payload>),
    /// String-keyed record.
    Object(BTreeMap<String, Payload>),
    /// Unordered collection transmitted as a list.
    Set(Vec<Payload>),
    /// Ordered key/value entries.
    Map(Vec<(Payload, Payload)>),
}

impl Payload {
    /// True when the value is `null` or `undefined`.
    #[must_use]
    pub const fn is_nullish(&self) -> bool { matches!(self, Self::Null | Self::Undefined) }

    /// Borrow the value as a string, when it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self { Self::String(value.to_owned()) }
}

impl From<String> for Payload {
    fn from(value: String) -> Self { Self::String(value) }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self { Self::Float(value) }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self { Self::Int(value) }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self { Self::Bool(value) }
}

/// Annotation tags understood by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Annotation {
    Number,
    Date,
    Regexp,
    Set,
    Map,
    Undefined,
    Custom(String),
}

impl Annotation {
    fn to_value(&self) -> Value {
        match self {
            Self::Number => Value::from("number"),
            Self::Date => Value::from("Date"),
            Self::Regexp => Value::from("regexp"),
            Self::Set => Value::from("set"),
            Self::Map => Value::from("map"),
            Self::Undefined => Value::from("undefined"),
            Self::Custom(name) => json!(["custom", name]),
        }
    }

    fn from_value(value: &Value) -> Result<Self, PayloadError> {
        match value {
            Value::String(tag) => match tag.as_str() {
                "number" => Ok(Self::Number),
                "Date" => Ok(Self::Date),
                "regexp" => Ok(Self::Regexp),
                "set" => Ok(Self::Set),
                "map" => Ok(Self::Map),
                "undefined" => Ok(Self::Undefined),
                other => Err(PayloadError::UnknownAnnotation(other.to_owned())),
            },
            Value::Array(parts) => match (parts.first(), parts.get(1)) {
                (Some(Value::String(kind)), Some(Value::String(name))) if kind == "custom" => {
                    Ok(Self::Custom(name.clone()))
                }
                _ => Err(PayloadError::MalformedAnnotations),
            },
            _ => Err(PayloadError::MalformedAnnotations),
        }
    }
}

/// Escape literal dots within one path segment.
#[must_use]
pub fn escape_segment(segment: &str) -> String { segment.replace('.', "\\.") }

/// Split an escaped dotted path back into its segments.
#[must_use]
pub fn parse_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' && chars.peek() == Some(&'.') {
            current.push('.');
            let _ = chars.next();
        } else if ch == '.' {
            segments.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    segments.push(current);
    segments
}

fn format_datetime(value: &NaiveDateTime) -> String {
    format!("{}Z", value.format(DATE_FORMAT))
}

fn parse_datetime(raw: &str) -> Result<NaiveDateTime, PayloadError> {
    let trimmed = raw.strip_suffix('Z').unwrap_or(raw);
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|_| PayloadError::InvalidTimestamp(raw.to_owned()))
}

fn format_time(value: &NaiveTime) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        value.hour(),
        value.minute(),
        value.second()
    )
}

fn parse_time(raw: &str) -> Result<NaiveTime, PayloadError> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| PayloadError::InvalidTimestamp(raw.to_owned()))
}

fn float_to_json(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Leaf transformation: the JSON stand-in plus its annotation, when the value
/// needs one.
fn transform_scalar(payload: &Payload) -> Option<(Value, Annotation)> {
    match payload {
        Payload::Undefined => Some((Value::Null, Annotation::Undefined)),
        Payload::Float(f) if f.is_nan() => Some((Value::from("NaN"), Annotation::Number)),
        Payload::Float(f) if f.is_infinite() => {
            let name = if f.is_sign_negative() { "-Infinity" } else { "Infinity" };
            Some((Value::from(name), Annotation::Number))
        }
        Payload::Date(d) => {
            let midnight = d.and_hms_opt(0, 0, 0).unwrap_or_default();
            Some((Value::from(format_datetime(&midnight)), Annotation::Date))
        }
        Payload::DateTime(dt) => Some((Value::from(format_datetime(dt)), Annotation::Date)),
        Payload::Time(t) => Some((
            Value::from(format_time(t)),
            Annotation::Custom("time".to_owned()),
        )),
        Payload::Regexp { pattern, flags } => Some((
            Value::from(format!("/{pattern}/{flags}")),
            Annotation::Regexp,
        )),
        _ => None,
    }
}

/// Result of encoding one subtree: either no annotations, a tree annotating
/// the node itself (`[tag]` or `[tag, {paths}]`), or a map of escaped
/// descendant paths.
enum Annotated {
    None,
    Tree(Value),
    Paths(BTreeMap<String, Value>),
}

fn merge_child(paths: &mut BTreeMap<String, Value>, key: &str, child: Annotated) {
    match child {
        Annotated::None => {}
        Annotated::Tree(tree) => {
            let _ = paths.insert(escape_segment(key), tree);
        }
        Annotated::Paths(children) => {
            for (sub, tree) in children {
                let _ = paths.insert(format!("{}.{sub}", escape_segment(key)), tree);
            }
        }
    }
}

fn encode_node(payload: &Payload) -> (Value, Annotated) {
    if let Some((plain, tag)) = transform_scalar(payload) {
        return (plain, Annotated::Tree(json!([tag.to_value()])));
    }

    match payload {
        Payload::Null => (Value::Null, Annotated::None),
        Payload::Bool(b) => (Value::Bool(*b), Annotated::None),
        Payload::Int(i) => (Value::from(*i), Annotated::None),
        Payload::Float(f) => (float_to_json(*f), Annotated::None),
        Payload::String(s) => (Value::from(s.clone()), Annotated::None),
        Payload::Array(items) => {
            let (plain, annotations) = encode_sequence(items);
            (plain, annotations)
        }
        Payload::Set(items) => {
            let (plain, annotations) = encode_sequence(items);
            (plain, wrap_collection(Annotation::Set, annotations))
        }
        Payload::Map(entries) => {
            let pairs: Vec<Payload> = entries
                .iter()
                .map(|(k, v)| Payload::Array(vec![k.clone(), v.clone()]))
                .collect();
            let (plain, annotations) = encode_sequence(&pairs);
            (plain, wrap_collection(Annotation::Map, annotations))
        }
        Payload::Object(fields) => {
            let mut plain = JsonMap::new();
            let mut paths = BTreeMap::new();
            for (key, value) in fields {
                let (child_plain, child_annotations) = encode_node(value);
                let _ = plain.insert(key.clone(), child_plain);
                merge_child(&mut paths, key, child_annotations);
            }
            let annotations = if paths.is_empty() {
                Annotated::None
            } else {
                Annotated::Paths(paths)
            };
            (Value::Object(plain), annotations)
        }
        // scalar transforms handled above
        Payload::Undefined
        | Payload::Date(_)
        | Payload::DateTime(_)
        | Payload::Time(_)
        | Payload::Regexp { .. } => (Value::Null, Annotated::None),
    }
}

fn encode_sequence(items: &[Payload]) -> (Value, Annotated) {
    let mut plain = Vec::with_capacity(items.len());
    let mut paths = BTreeMap::new();
    for (index, item) in items.iter().enumerate() {
        let (child_plain, child_annotations) = encode_node(item);
        plain.push(child_plain);
        merge_child(&mut paths, &index.to_string(), child_annotations);
    }
    let annotations = if paths.is_empty() {
        Annotated::None
    } else {
        Annotated::Paths(paths)
    };
    (Value::Array(plain), annotations)
}

/// A set or map node carries its own tag alongside any descendant paths.
fn wrap_collection(tag: Annotation, inner: Annotated) -> Annotated {
    match inner {
        Annotated::None => Annotated::Tree(json!([tag.to_value()])),
        Annotated::Paths(paths) => {
            let children: JsonMap<String, Value> = paths.into_iter().collect();
            Annotated::Tree(json!([tag.to_value(), Value::Object(children)]))
        }
        Annotated::Tree(_) => Annotated::Tree(json!([tag.to_value()])),
    }
}

/// Encode a payload tree into a JSON-compatible value and an optional
/// annotation object of the form `{"values": <tree>}`.
#[must_use]
pub fn encode(payload: &Payload) -> (Value, Option<Value>) {
    let (plain, annotations) = encode_node(payload);
    let meta = match annotations {
        Annotated::None => None,
        Annotated::Tree(tree) => Some(json!({ "values": tree })),
        Annotated::Paths(paths) => {
            let map: JsonMap<String, Value> = paths.into_iter().collect();
            Some(json!({ "values": Value::Object(map) }))
        }
    };
    (plain, meta)
}

/// Convert plain JSON into the payload tree, without annotations applied.
fn lift(value: &Value) -> Payload {
    match value {
        Value::Null => Payload::Null,
        Value::Bool(b) => Payload::Bool(*b),
        Value::Number(n) => n
            .as_i64()
            .map_or_else(|| Payload::Float(n.as_f64().unwrap_or(f64::NAN)), Payload::Int),
        Value::String(s) => Payload::String(s.clone()),
        Value::Array(items) => Payload::Array(items.iter().map(lift).collect()),
        Value::Object(fields) => Payload::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), lift(v)))
                .collect(),
        ),
    }
}

fn revive(node: Payload, tag: &Annotation) -> Result<Payload, PayloadError> {
    let mismatch = |found: &Payload, tag: &Annotation| PayloadError::MismatchedValue {
        tag: format!("{tag:?}"),
        found: format!("{found:?}"),
    };

    match tag {
        Annotation::Undefined => Ok(Payload::Undefined),
        Annotation::Number => match &node {
            Payload::String(raw) => match raw.as_str() {
                "Infinity" => Ok(Payload::Float(f64::INFINITY)),
                "-Infinity" => Ok(Payload::Float(f64::NEG_INFINITY)),
                "NaN" => Ok(Payload::Float(f64::NAN)),
                _ => Err(mismatch(&node, tag)),
            },
            _ => Err(mismatch(&node, tag)),
        },
        Annotation::Date => match &node {
            Payload::String(raw) => {
                let parsed = parse_datetime(raw)?;
                // a timestamp at exactly midnight revives as a plain date
                if parsed.time() == NaiveTime::MIN {
                    Ok(Payload::Date(parsed.date()))
                } else {
                    Ok(Payload::DateTime(parsed))
                }
            }
            _ => Err(mismatch(&node, tag)),
        },
        Annotation::Custom(name) if name == "time" => match &node {
            Payload::String(raw) => Ok(Payload::Time(parse_time(raw)?)),
            _ => Err(mismatch(&node, tag)),
        },
        Annotation::Custom(name) => Err(PayloadError::UnknownAnnotation(name.clone())),
        Annotation::Regexp => match &node {
            Payload::String(raw) => {
                let body = raw.strip_prefix('/').ok_or_else(|| mismatch(&node, tag))?;
                let (pattern, flags) =
                    body.rsplit_once('/').ok_or_else(|| mismatch(&node, tag))?;
                Ok(Payload::Regexp {
                    pattern: pattern.to_owned(),
                    flags: flags.to_owned(),
                })
            }
            _ => Err(mismatch(&node, tag)),
        },
        Annotation::Set => match node {
            Payload::Array(items) => Ok(Payload::Set(items)),
            other => Err(mismatch(&other, tag)),
        },
        Annotation::Map => match node {
            Payload::Array(items) => {
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    let Payload::Array(pair) = item else {
                        return Err(PayloadError::MalformedAnnotations);
                    };
                    let mut parts = pair.into_iter();
                    let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                        return Err(PayloadError::MalformedAnnotations);
                    };
                    entries.push((key, value));
                }
                Ok(Payload::Map(entries))
            }
            other => Err(mismatch(&other, tag)),
        },
    }
}

fn apply_at_path(
    node: Payload,
    path: &[String],
    tag: &Annotation,
) -> Result<Payload, PayloadError> {
    for segment in path {
        if DISALLOWED_SEGMENTS.contains(&segment.as_str()) {
            return Err(PayloadError::DisallowedSegment(segment.clone()));
        }
    }

    let Some((head, rest)) = path.split_first() else {
        return revive(node, tag);
    };

    match node {
        Payload::Array(mut items) => {
            apply_at_index(&mut items, head, rest, tag, path)?;
            Ok(Payload::Array(items))
        }
        Payload::Set(mut items) => {
            apply_at_index(&mut items, head, rest, tag, path)?;
            Ok(Payload::Set(items))
        }
        Payload::Object(mut fields) => {
            let taken = fields
                .remove(head)
                .ok_or_else(|| PayloadError::MissingPath(path.join(".")))?;
            let revived = apply_at_path(taken, rest, tag)?;
            let _ = fields.insert(head.clone(), revived);
            Ok(Payload::Object(fields))
        }
        other => Err(PayloadError::MissingPath(format!(
            "{} (at {other:?})",
            path.join(".")
        ))),
    }
}

fn apply_at_index(
    items: &mut [Payload],
    head: &str,
    rest: &[String],
    tag: &Annotation,
    path: &[String],
) -> Result<(), PayloadError> {
    let index: usize = head
        .parse()
        .map_err(|_| PayloadError::MissingPath(path.join(".")))?;
    let slot = items
        .get_mut(index)
        .ok_or_else(|| PayloadError::MissingPath(path.join(".")))?;
    let taken = std::mem::replace(slot, Payload::Null);
    *slot = apply_at_path(taken, rest, tag)?;
    Ok(())
}

fn apply_tree(
    node: Payload,
    tree: &Value,
    prefix: &[String],
) -> Result<Payload, PayloadError> {
    match tree {
        Value::Array(parts) => {
            let tag = Annotation::from_value(
                parts.first().ok_or(PayloadError::MalformedAnnotations)?,
            )?;
            // descendants are revived before the node's own tag converts the
            // container shape
            let mut current = node;
            if let Some(children) = parts.get(1) {
                current = apply_tree(current, children, prefix)?;
            }
            apply_at_path(current, prefix, &tag)
        }
        Value::Object(children) => {
            let mut current = node;
            for (path, subtree) in children {
                let mut full = prefix.to_vec();
                full.extend(parse_path(path));
                match subtree {
                    Value::Array(_) => {
                        current = apply_tree(current, subtree, &full)?;
                    }
                    Value::Object(_) => {
                        current = apply_tree(current, subtree, &full)?;
                    }
                    _ => return Err(PayloadError::MalformedAnnotations),
                }
            }
            Ok(current)
        }
        _ => Err(PayloadError::MalformedAnnotations),
    }
}

/// Decode a plain JSON value plus its optional annotation object back into
/// the payload tree.
///
/// # Errors
/// Returns an error when the annotation tree is malformed, addresses a
/// missing path, or does not match the value at its target.
pub fn decode(value: &Value, meta: Option<&Value>) -> Result<Payload, PayloadError> {
    let lifted = lift(value);
    let Some(meta) = meta else {
        return Ok(lifted);
    };
    let Some(values) = meta.get("values") else {
        return Ok(lifted);
    };
    apply_tree(lifted, values, &[])
}
