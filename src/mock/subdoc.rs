//! Sub-document path engine for the mock cluster
//!
//! Paths look like `a.b[2].c`, with backticks quoting field names that
//! contain path syntax. Negative array indexes count from the end.

use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::status::StatusCode;
use crate::subdoc::{SubDocFlags, SubDocOp, SubDocOpKind};

use super::store::Document;

type PathResult<T> = std::result::Result<T, StatusCode>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(i64),
}

#[derive(PartialEq, Eq)]
enum Last {
    Start,
    Field,
    Index,
    Dot,
}

/// Split a path into segments; `""` is the document root
pub fn parse_path(path: &str) -> PathResult<Vec<Segment>> {
    const INVALID: StatusCode = StatusCode::SubDocPathInvalid;

    let mut segments = Vec::new();
    let mut field = String::new();
    let mut last = Last::Start;
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '`' if last != Last::Index => {
                loop {
                    match chars.next() {
                        Some('`') if chars.peek() == Some(&'`') => {
                            chars.next();
                            field.push('`');
                        }
                        Some('`') => break,
                        Some(c) => field.push(c),
                        None => return Err(INVALID),
                    }
                }
                last = Last::Field;
            }
            '.' => {
                match last {
                    Last::Field => segments.push(Segment::Field(std::mem::take(&mut field))),
                    Last::Index => {}
                    _ => return Err(INVALID),
                }
                last = Last::Dot;
            }
            '[' if last != Last::Dot => {
                if last == Last::Field {
                    segments.push(Segment::Field(std::mem::take(&mut field)));
                }
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(c) => digits.push(c),
                        None => return Err(INVALID),
                    }
                }
                segments.push(Segment::Index(digits.parse().map_err(|_| INVALID)?));
                last = Last::Index;
            }
            c if last != Last::Index && c != '[' && c != ']' => {
                field.push(c);
                last = Last::Field;
            }
            _ => return Err(INVALID),
        }
    }

    match last {
        Last::Dot => Err(INVALID),
        Last::Field => {
            segments.push(Segment::Field(field));
            Ok(segments)
        }
        _ => Ok(segments),
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        let index = index as usize;
        (index < len).then_some(index)
    } else {
        let back = index.unsigned_abs() as usize;
        (back <= len).then(|| len - back)
    }
}

fn get<'a>(root: &'a Value, path: &[Segment]) -> PathResult<&'a Value> {
    let mut cur = root;
    for segment in path {
        cur = match (segment, cur) {
            (Segment::Field(name), Value::Object(map)) => {
                map.get(name).ok_or(StatusCode::SubDocPathNotFound)?
            }
            (Segment::Index(ix), Value::Array(items)) => {
                let i = resolve_index(*ix, items.len()).ok_or(StatusCode::SubDocPathNotFound)?;
                &items[i]
            }
            _ => return Err(StatusCode::SubDocPathMismatch),
        };
    }
    Ok(cur)
}

/// Walk to `path`, creating missing object fields when `mkdir` is set
fn get_mut<'a>(root: &'a mut Value, path: &[Segment], mkdir: bool) -> PathResult<&'a mut Value> {
    let mut cur = root;
    for segment in path {
        cur = match segment {
            Segment::Field(name) => {
                let map = cur.as_object_mut().ok_or(StatusCode::SubDocPathMismatch)?;
                if mkdir && !map.contains_key(name) {
                    map.insert(name.clone(), Value::Object(Map::new()));
                }
                map.get_mut(name).ok_or(StatusCode::SubDocPathNotFound)?
            }
            Segment::Index(ix) => {
                let items = cur.as_array_mut().ok_or(StatusCode::SubDocPathMismatch)?;
                let i = resolve_index(*ix, items.len()).ok_or(StatusCode::SubDocPathNotFound)?;
                &mut items[i]
            }
        };
    }
    Ok(cur)
}

/// Walk to `path`, inserting `default` at the leaf if it is a missing field
fn get_or_insert<'a>(
    root: &'a mut Value,
    path: &[Segment],
    mkdir: bool,
    default: impl FnOnce() -> Value,
) -> PathResult<&'a mut Value> {
    let Some((last, parent)) = path.split_last() else {
        return Ok(root);
    };
    let parent = get_mut(root, parent, mkdir)?;
    match last {
        Segment::Field(name) => {
            let map = parent.as_object_mut().ok_or(StatusCode::SubDocPathMismatch)?;
            Ok(map.entry(name.clone()).or_insert_with(default))
        }
        Segment::Index(ix) => {
            let items = parent.as_array_mut().ok_or(StatusCode::SubDocPathMismatch)?;
            let i = resolve_index(*ix, items.len()).ok_or(StatusCode::SubDocPathNotFound)?;
            Ok(&mut items[i])
        }
    }
}

fn split_last(path: &[Segment]) -> PathResult<(&Segment, &[Segment])> {
    path.split_last().ok_or(StatusCode::SubDocPathInvalid)
}

fn parse_value(value: &[u8]) -> PathResult<Value> {
    serde_json::from_slice(value).map_err(|_| StatusCode::SubDocCantInsert)
}

/// Array ops accept several comma-separated values
fn parse_values(value: &[u8]) -> PathResult<Vec<Value>> {
    let mut wrapped = Vec::with_capacity(value.len() + 2);
    wrapped.push(b'[');
    wrapped.extend_from_slice(value);
    wrapped.push(b']');
    let values: Vec<Value> =
        serde_json::from_slice(&wrapped).map_err(|_| StatusCode::SubDocCantInsert)?;
    if values.is_empty() {
        return Err(StatusCode::SubDocCantInsert);
    }
    Ok(values)
}

fn to_bytes(value: &Value) -> PathResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|_| StatusCode::InternalError)
}

fn hex(value: u64) -> String {
    format!("0x{:016x}", value)
}

/// The `$document` virtual xattr
fn virtual_document(doc: &Document) -> Value {
    json!({
        "CAS": hex(doc.cas),
        "exptime": doc.expires_at,
        "flags": doc.flags,
        "seqno": hex(doc.seqno),
        "value_bytes": doc.value.len(),
        "deleted": doc.deleted,
    })
}

// =============================================================================
// Lookups
// =============================================================================

/// Run every lookup op; failures are per path
pub fn lookup(doc: &Document, ops: &[SubDocOp]) -> Vec<(StatusCode, Bytes)> {
    let body: PathResult<Value> =
        serde_json::from_slice(&doc.value).map_err(|_| StatusCode::SubDocNotJson);

    ops.iter()
        .map(|op| match lookup_one(doc, &body, op) {
            Ok(value) => (StatusCode::Success, value),
            Err(status) => (status, Bytes::new()),
        })
        .collect()
}

fn lookup_one(doc: &Document, body: &PathResult<Value>, op: &SubDocOp) -> PathResult<Bytes> {
    if op.kind == SubDocOpKind::GetDoc {
        return Ok(doc.value.clone());
    }

    let segments = parse_path(&op.path)?;
    let xattr_root;
    let root: &Value = if op.flags.contains(SubDocFlags::XATTR_PATH) {
        match segments.first() {
            Some(Segment::Field(name)) if name == "$document" => {
                xattr_root = json!({ "$document": virtual_document(doc) });
                &xattr_root
            }
            Some(Segment::Field(name)) if name.starts_with('$') => {
                return Err(StatusCode::SubDocXattrUnknownVAttr)
            }
            Some(Segment::Field(_)) => {
                xattr_root = Value::Object(doc.xattrs.clone());
                &xattr_root
            }
            _ => return Err(StatusCode::SubDocPathInvalid),
        }
    } else {
        body.as_ref().map_err(|status| *status)?
    };

    let value = get(root, &segments)?;
    match op.kind {
        SubDocOpKind::Get => to_bytes(value),
        SubDocOpKind::Exists => Ok(Bytes::new()),
        SubDocOpKind::GetCount => {
            let count = match value {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                _ => return Err(StatusCode::SubDocPathMismatch),
            };
            Ok(Bytes::from(count.to_string()))
        }
        _ => Err(StatusCode::SubDocBadCombo),
    }
}

// =============================================================================
// Mutations
// =============================================================================

/// Values substituted for `${Mutation.*}` macros
#[derive(Debug, Clone, Copy)]
pub struct MacroValues {
    pub cas: u64,
    pub seqno: u64,
}

/// Result of a successful multi-mutation
#[derive(Debug)]
pub struct MutationOutcome {
    pub body: Bytes,
    pub xattrs: Map<String, Value>,
    /// A full-document delete was part of the batch
    pub delete: bool,
    /// `(index, status, value)` for ops that return a value
    pub results: Vec<(u8, StatusCode, Bytes)>,
}

enum Body {
    Raw(Bytes),
    Parsed(Value),
}

impl Body {
    fn parsed(&mut self) -> PathResult<&mut Value> {
        if let Body::Raw(raw) = self {
            let value = serde_json::from_slice(raw).map_err(|_| StatusCode::SubDocNotJson)?;
            *self = Body::Parsed(value);
        }
        match self {
            Body::Parsed(value) => Ok(value),
            Body::Raw(_) => Err(StatusCode::InternalError),
        }
    }

    fn into_bytes(self) -> PathResult<Bytes> {
        match self {
            Body::Raw(raw) => Ok(raw),
            Body::Parsed(value) => to_bytes(&value),
        }
    }
}

fn expand_macros(value: &[u8], macros: MacroValues) -> PathResult<Vec<u8>> {
    let text = std::str::from_utf8(value).map_err(|_| StatusCode::SubDocCantInsert)?;
    let expanded = text
        .replace("${Mutation.CAS}", &hex(macros.cas))
        .replace("${Mutation.seqno}", &hex(macros.seqno));
    if expanded.contains("${") {
        return Err(StatusCode::SubDocXattrUnknownMacro);
    }
    Ok(expanded.into_bytes())
}

/// Apply every mutation op, all or nothing
///
/// On failure returns the index of the first failing op and its status.
pub fn mutate(
    doc: &Document,
    exists: bool,
    ops: &[SubDocOp],
    macros: MacroValues,
) -> std::result::Result<MutationOutcome, (u8, StatusCode)> {
    // Every xattr op must address the same top-level attribute
    let mut xattr_key: Option<&str> = None;
    for (index, op) in ops.iter().enumerate() {
        if !op.flags.contains(SubDocFlags::XATTR_PATH) {
            continue;
        }
        let key = op.path.split(['.', '[']).next().unwrap_or_default();
        match xattr_key {
            Some(existing) if existing != key => {
                return Err((index as u8, StatusCode::SubDocXattrInvalidKeyCombo))
            }
            _ => xattr_key = Some(key),
        }
    }

    let mut body = Body::Raw(doc.value.clone());
    let mut xattrs = Value::Object(doc.xattrs.clone());
    let mut delete = false;
    let mut results = Vec::new();

    for (index, op) in ops.iter().enumerate() {
        let fail = |status| (index as u8, status);
        match op.kind {
            SubDocOpKind::SetDoc => body = Body::Raw(op.value.clone()),
            SubDocOpKind::AddDoc if exists => return Err(fail(StatusCode::KeyExists)),
            SubDocOpKind::AddDoc => body = Body::Raw(op.value.clone()),
            SubDocOpKind::DeleteDoc => delete = true,
            _ => {
                if let Some(value) = mutate_one(&mut body, &mut xattrs, op, macros).map_err(fail)? {
                    results.push((index as u8, StatusCode::Success, value));
                }
            }
        }
    }

    let body = body.into_bytes().map_err(|status| (0, status))?;
    let xattrs = match xattrs {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(MutationOutcome {
        body,
        xattrs,
        delete,
        results,
    })
}

fn mutate_one(
    body: &mut Body,
    xattrs: &mut Value,
    op: &SubDocOp,
    macros: MacroValues,
) -> PathResult<Option<Bytes>> {
    let is_xattr = op.flags.contains(SubDocFlags::XATTR_PATH);
    if op.flags.contains(SubDocFlags::EXPAND_MACROS) && !is_xattr {
        return Err(StatusCode::SubDocXattrInvalidFlagCombo);
    }

    let segments = parse_path(&op.path)?;
    let root = if is_xattr {
        match segments.first() {
            Some(Segment::Field(name)) if name.starts_with('$') => {
                return Err(StatusCode::SubDocXattrCannotModifyVAttr)
            }
            Some(Segment::Field(_)) => xattrs,
            _ => return Err(StatusCode::SubDocPathInvalid),
        }
    } else {
        body.parsed()?
    };

    let value = if op.flags.contains(SubDocFlags::EXPAND_MACROS) {
        expand_macros(&op.value, macros)?
    } else {
        op.value.to_vec()
    };
    let mkdir = op.flags.contains(SubDocFlags::MKDIR_P);

    apply(root, &segments, op.kind, &value, mkdir)
}

fn apply(
    root: &mut Value,
    segments: &[Segment],
    kind: SubDocOpKind,
    value: &[u8],
    mkdir: bool,
) -> PathResult<Option<Bytes>> {
    match kind {
        SubDocOpKind::DictAdd | SubDocOpKind::DictSet => {
            let (last, parent) = split_last(segments)?;
            let Segment::Field(name) = last else {
                return Err(StatusCode::SubDocPathMismatch);
            };
            let new = parse_value(value)?;
            let map = get_mut(root, parent, mkdir)?
                .as_object_mut()
                .ok_or(StatusCode::SubDocPathMismatch)?;
            if kind == SubDocOpKind::DictAdd && map.contains_key(name) {
                return Err(StatusCode::SubDocPathExists);
            }
            map.insert(name.clone(), new);
        }
        SubDocOpKind::Replace => {
            if segments.is_empty() {
                return Err(StatusCode::SubDocPathInvalid);
            }
            let new = parse_value(value)?;
            *get_mut(root, segments, false)? = new;
        }
        SubDocOpKind::Delete => {
            let (last, parent) = split_last(segments)?;
            match (last, get_mut(root, parent, false)?) {
                (Segment::Field(name), Value::Object(map)) => {
                    map.remove(name).ok_or(StatusCode::SubDocPathNotFound)?;
                }
                (Segment::Index(ix), Value::Array(items)) => {
                    let i = resolve_index(*ix, items.len()).ok_or(StatusCode::SubDocPathNotFound)?;
                    items.remove(i);
                }
                _ => return Err(StatusCode::SubDocPathMismatch),
            }
        }
        SubDocOpKind::ArrayPushLast | SubDocOpKind::ArrayPushFirst => {
            let values = parse_values(value)?;
            let target = if mkdir {
                get_or_insert(root, segments, true, || Value::Array(Vec::new()))?
            } else {
                get_mut(root, segments, false)?
            };
            let items = target.as_array_mut().ok_or(StatusCode::SubDocPathMismatch)?;
            if kind == SubDocOpKind::ArrayPushLast {
                items.extend(values);
            } else {
                items.splice(0..0, values);
            }
        }
        SubDocOpKind::ArrayInsert => {
            let (last, parent) = split_last(segments)?;
            let Segment::Index(ix) = *last else {
                return Err(StatusCode::SubDocPathInvalid);
            };
            if ix < 0 {
                return Err(StatusCode::SubDocPathInvalid);
            }
            let values = parse_values(value)?;
            let items = get_mut(root, parent, false)?
                .as_array_mut()
                .ok_or(StatusCode::SubDocPathMismatch)?;
            let at = ix as usize;
            if at > items.len() {
                return Err(StatusCode::SubDocPathNotFound);
            }
            items.splice(at..at, values);
        }
        SubDocOpKind::ArrayAddUnique => {
            let new = parse_value(value)?;
            if new.is_object() || new.is_array() {
                return Err(StatusCode::SubDocCantInsert);
            }
            let target = if mkdir {
                get_or_insert(root, segments, true, || Value::Array(Vec::new()))?
            } else {
                get_mut(root, segments, false)?
            };
            let items = target.as_array_mut().ok_or(StatusCode::SubDocPathMismatch)?;
            if items.iter().any(|v| v.is_object() || v.is_array()) {
                return Err(StatusCode::SubDocPathMismatch);
            }
            if items.contains(&new) {
                return Err(StatusCode::SubDocPathExists);
            }
            items.push(new);
        }
        SubDocOpKind::Counter => {
            let delta: i64 = std::str::from_utf8(value)
                .ok()
                .and_then(|text| text.trim().parse().ok())
                .ok_or(StatusCode::SubDocBadDelta)?;
            if delta == 0 {
                return Err(StatusCode::SubDocBadDelta);
            }
            if segments.is_empty() {
                return Err(StatusCode::SubDocPathInvalid);
            }
            let target = get_or_insert(root, segments, mkdir, || Value::from(0))?;
            let current = target.as_i64().ok_or(StatusCode::SubDocPathMismatch)?;
            let next = current.checked_add(delta).ok_or(StatusCode::SubDocBadRange)?;
            *target = Value::from(next);
            return Ok(Some(Bytes::from(next.to_string())));
        }
        SubDocOpKind::Get
        | SubDocOpKind::Exists
        | SubDocOpKind::GetCount
        | SubDocOpKind::GetDoc
        | SubDocOpKind::SetDoc
        | SubDocOpKind::AddDoc
        | SubDocOpKind::DeleteDoc => return Err(StatusCode::SubDocBadCombo),
    }
    Ok(None)
}
