//! Property values
//!
//! Values are immutable and compared structurally. Collections are persistent
//! (`im`) so that snapshots share structure between commits.

use std::fmt;
use std::sync::Arc;

use im::{OrdSet, Vector};

use crate::MutableId;

/// A property value
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Value {
    /// No value (the "null" of a property)
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Text(Arc<str>),
    /// Reference to a mutable
    Mutable(MutableId),
    /// Unordered collection with deterministic iteration
    Set(OrdSet<Value>),
    /// Ordered collection
    List(Vector<Value>),
}

impl Value {
    pub fn text(s: &str) -> Self {
        Value::Text(Arc::from(s))
    }

    pub fn set<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Value::Set(items.into_iter().collect())
    }

    pub fn list<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Value::List(items.into_iter().collect())
    }

    /// Empty means absent or an empty collection
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Empty => true,
            Value::Set(s) => s.is_empty(),
            Value::List(l) => l.is_empty(),
            _ => false,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Value::Set(_) | Value::List(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    pub fn as_mutable(&self) -> Option<MutableId> {
        match self {
            Value::Mutable(m) => Some(*m),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Number of members; scalars count as one, `Empty` as zero
    pub fn len(&self) -> usize {
        match self {
            Value::Empty => 0,
            Value::Set(s) => s.len(),
            Value::List(l) => l.len(),
            _ => 1,
        }
    }

    /// Iterate the members of a collection (nothing for scalars)
    pub fn members(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Value::Set(s) => Box::new(s.iter()),
            Value::List(l) => Box::new(l.iter()),
            _ => Box::new(std::iter::empty()),
        }
    }

    /// First member in iteration order
    pub fn first(&self) -> Option<&Value> {
        self.members().next()
    }

    /// Mutables referenced directly by this value
    pub fn mutables(&self) -> Vec<MutableId> {
        match self {
            Value::Mutable(m) => vec![*m],
            _ => self.members().filter_map(Value::as_mutable).collect(),
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        match self {
            Value::Set(s) => s.contains(value),
            Value::List(l) => l.iter().any(|v| v == value),
            other => other == value,
        }
    }

    /// Add a member; appends for lists when not yet present
    pub fn with(&self, value: Value) -> Value {
        match self {
            Value::Set(s) => Value::Set(s.update(value)),
            Value::List(l) => {
                if l.iter().any(|v| *v == value) {
                    self.clone()
                } else {
                    let mut l = l.clone();
                    l.push_back(value);
                    Value::List(l)
                }
            }
            Value::Empty => Value::Set(OrdSet::unit(value)),
            other => Value::Set(OrdSet::unit(other.clone()).update(value)),
        }
    }

    /// Remove a member; a scalar equal to `value` becomes `Empty`
    pub fn without(&self, value: &Value) -> Value {
        match self {
            Value::Set(s) => Value::Set(s.without(value)),
            Value::List(l) => Value::List(l.iter().filter(|v| *v != value).cloned().collect()),
            other if other == value => Value::Empty,
            other => other.clone(),
        }
    }

    pub fn add_all<I: IntoIterator<Item = Value>>(&self, values: I) -> Value {
        values.into_iter().fold(self.clone(), |acc, v| acc.with(v))
    }

    fn set_view(&self) -> Option<OrdSet<Value>> {
        match self {
            Value::Set(s) => Some(s.clone()),
            Value::Empty => Some(OrdSet::new()),
            _ => None,
        }
    }

    fn list_view(&self) -> Option<Vector<Value>> {
        match self {
            Value::List(l) => Some(l.clone()),
            Value::Empty => Some(Vector::new()),
            _ => None,
        }
    }

    /// Three-way merge of two branches `pre` and `post` that both started at `start`.
    ///
    /// Only collections are mergeable: members added by either branch are kept,
    /// members removed by either branch are dropped. Returns `None` when
    /// `start` is not mergeable or the branches are of another kind.
    pub fn merge3(start: &Value, pre: &Value, post: &Value) -> Option<Value> {
        match start {
            Value::Set(base) => {
                let pre = pre.set_view()?;
                let post = post.set_view()?;
                let mut result = base.clone();
                for v in pre.iter().chain(post.iter()) {
                    if !base.contains(v) {
                        result.insert(v.clone());
                    }
                }
                for v in base.iter() {
                    if !pre.contains(v) || !post.contains(v) {
                        result.remove(v);
                    }
                }
                Some(Value::Set(result))
            }
            Value::List(base) => {
                let pre = pre.list_view()?;
                let post = post.list_view()?;
                let in_base = |v: &Value| base.iter().any(|b| b == v);
                let mut result = post.clone();
                for v in pre.iter() {
                    if !in_base(v) && !result.iter().any(|r| r == v) {
                        result.push_back(v.clone());
                    }
                }
                let result = result
                    .iter()
                    .filter(|v| !(in_base(v) && !pre.iter().any(|p| p == *v)))
                    .cloned()
                    .collect();
                Some(Value::List(result))
            }
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

impl From<MutableId> for Value {
    fn from(m: MutableId) -> Self {
        Value::Mutable(m)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => write!(f, "<empty>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(t) => write!(f, "{:?}", t),
            Value::Mutable(m) => write!(f, "{}", m),
            Value::Set(_) | Value::List(_) => {
                let (open, close) = if self.is_list() { ("[", "]") } else { ("{", "}") };
                write!(f, "{}", open)?;
                for (i, v) in self.members().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "{}", close)
            }
        }
    }
}
