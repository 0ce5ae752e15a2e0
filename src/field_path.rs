use anyhow::{bail, Error};
use bson::{Bson, Document};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// A dotted path. Every segment is a field name, numeric ones included.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, Error> {
        if path.is_empty() {
            bail!("FieldPath cannot be constructed with empty string");
        }

        let segments: Vec<String> = path.split('.').map(str::to_owned).collect();
        for segment in &segments {
            if segment.is_empty() {
                bail!("FieldPath field names may not be empty strings ({path})");
            }
            if segment.starts_with('$') {
                bail!("FieldPath field names may not start with '$' ({path})");
            }
            if segment.contains('\0') {
                bail!("FieldPath field names may not contain '\\0' ({path})");
            }
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether `self` lies strictly below `prefix` (`a.b` is under `a`).
    pub fn is_under(&self, prefix: &Self) -> bool {
        self.segments.len() > prefix.segments.len() && self.segments.starts_with(&prefix.segments)
    }

    pub fn strip_prefix(&self, prefix: &Self) -> Option<Self> {
        self.is_under(prefix).then(|| Self {
            segments: self.segments[prefix.segments.len()..].to_vec(),
        })
    }
}

impl Display for FieldPath {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        formatter.write_str(&self.segments.join("."))
    }
}

/// Collects every value addressed by `path`. Arrays met on the way are
/// traversed element by element; the final value is returned as is.
pub fn resolve<'a>(document: &'a Document, path: &FieldPath) -> Vec<&'a Bson> {
    let mut values = vec![];
    if let Some((head, rest)) = path.segments.split_first() {
        if let Some(value) = document.get(head) {
            resolve_into(value, rest, &mut values);
        }
    }

    values
}

fn resolve_into<'a>(value: &'a Bson, segments: &[String], values: &mut Vec<&'a Bson>) {
    let Some((head, rest)) = segments.split_first() else {
        values.push(value);
        return;
    };

    match value {
        Bson::Document(document) => {
            if let Some(value) = document.get(head) {
                resolve_into(value, rest, values);
            }
        }
        Bson::Array(elements) => {
            for element in elements {
                if matches!(element, Bson::Array(_) | Bson::Document(_)) {
                    resolve_into(element, segments, values);
                }
            }
        }
        _ => {}
    }
}

/// Like [`resolve`], but array values are replaced by their elements.
pub fn resolve_flat<'a>(document: &'a Document, path: &FieldPath) -> Vec<&'a Bson> {
    resolve(document, path)
        .into_iter()
        .flat_map(|value| match value {
            Bson::Array(elements) => elements.iter().collect(),
            value => vec![value],
        })
        .collect()
}

/// Exact lookup, without any array traversal.
pub fn get<'a>(document: &'a Document, path: &FieldPath) -> Option<&'a Bson> {
    let (last, init) = path.segments.split_last()?;
    let mut document = document;
    for segment in init {
        document = document.get_document(segment).ok()?;
    }

    document.get(last)
}

/// Writes `value` at `path`, replacing non-document intermediates.
pub fn set(document: &mut Document, path: &FieldPath, value: Bson) {
    let Some((last, init)) = path.segments.split_last() else {
        return;
    };

    let mut document = document;
    for segment in init {
        if !matches!(document.get(segment), Some(Bson::Document(_))) {
            document.insert(segment.clone(), Document::new());
        }
        let Some(Bson::Document(inner)) = document.get_mut(segment) else {
            unreachable!()
        };
        document = inner;
    }

    document.insert(last.clone(), value);
}

/// Removes the field at `path`, without any array traversal.
pub fn remove(document: &mut Document, path: &FieldPath) -> Option<Bson> {
    let (last, init) = path.segments.split_last()?;
    let mut document = document;
    for segment in init {
        document = document.get_document_mut(segment).ok()?;
    }

    document.remove(last)
}
