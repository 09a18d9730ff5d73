//! Paths into a value tree
//!
//! A [`Path`] is the list of segments leading from an entity's fields to a
//! nested value. The normalizer walks the incoming tree and the stored record
//! in lock-step by resolving the same path against both.

use super::value::Fields;
use super::Value;
use std::fmt;

/// One step into a value tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Object field by name
    Field(String),
    /// Array element by position
    Index(usize),
}

/// Path relative to an entity's field map
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<PathSegment>);

impl Path {
    /// The empty path (the entity itself)
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Extend with a field segment
    pub fn field(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Field(name.into()));
        Self(segments)
    }

    /// Extend with an index segment
    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Name of the entity field this path starts with
    pub fn top_field(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathSegment::Field(name)) => Some(name),
            _ => None,
        }
    }

    /// Resolve this path against an entity's fields
    pub fn resolve_in<'a>(&self, fields: &'a Fields) -> Option<&'a Value> {
        let (first, rest) = self.0.split_first()?;
        let start = match first {
            PathSegment::Field(name) => fields.get(name)?,
            PathSegment::Index(_) => return None,
        };
        resolve_segments(start, rest)
    }

    /// Resolve this path against a value
    pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        resolve_segments(value, &self.0)
    }

    /// Mutable variant of [`Path::resolve`]
    pub fn resolve_mut<'a>(&self, value: &'a mut Value) -> Option<&'a mut Value> {
        let mut current = value;
        for segment in &self.0 {
            current = match (segment, current) {
                (PathSegment::Field(name), Value::Object(fields)) => fields.get_mut(name)?,
                (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn resolve_segments<'a>(mut current: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Field(name), Value::Object(fields)) => fields.get(name)?,
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) if i == 0 => write!(f, "{}", name)?,
                PathSegment::Field(name) => write!(f, ".{}", name)?,
                PathSegment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}
