//! Text operations over a linear buffer.
//!
//! An [`Operation`] is an ordered list of components walked left to right
//! across the base buffer:
//!
//! ```text
//! base:    H e l l o ␣ w o r l d
//!          └─retain 6─┘ └del 5┘
//! insert "there" after the retain:
//! target:  H e l l o ␣ t h e r e
//! ```
//!
//! The sum of `Retain` and `Delete` lengths is the operation's base length
//! and must equal the length of the buffer it is applied to. Lengths are
//! counted in Unicode scalar values, never bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the transform engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// Two operations do not share the lengths required for compose/transform.
    #[error("Incompatible lengths: expected {expected}, got {actual}")]
    IncompatibleLengths { expected: usize, actual: usize },

    /// A retain or delete step ran past the end of the buffer.
    #[error("Operation out of bounds: needs {needed} chars, buffer has {available}")]
    OutOfBounds { needed: usize, available: usize },

    /// The operation stopped before consuming the whole buffer.
    #[error("Operation covers {covered} chars but buffer has {available}")]
    LengthMismatch { covered: usize, available: usize },

    /// An acknowledgement arrived while nothing was in flight.
    #[error("No operation awaiting acknowledgement")]
    UnexpectedAck,

    /// Component lengths sum past `usize::MAX`.
    #[error("Operation lengths overflow")]
    LengthOverflow,
}

/// A single step of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    /// Skip over `n` chars, keeping them.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove the next `n` chars.
    Delete(usize),
}

impl Component {
    /// Number of chars this component spans in its own coordinate space.
    pub fn len(&self) -> usize {
        match self {
            Component::Retain(n) | Component::Delete(n) => *n,
            Component::Insert(s) => char_len(s),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An immutable, normalised edit from one buffer to the next.
///
/// Built with the chaining constructors:
///
/// ```
/// use quill_core::Operation;
///
/// let op = Operation::new().retain(1).insert("X").retain(1);
/// assert_eq!(op.apply("AB").unwrap(), "AXB");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Component>", into = "Vec<Component>")]
pub struct Operation {
    ops: Vec<Component>,
    base_len: usize,
    target_len: usize,
}

impl Operation {
    /// Empty operation (valid against the empty buffer only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation that keeps a buffer of `len` chars unchanged.
    pub fn identity(len: usize) -> Self {
        Self::new().retain(len)
    }

    /// Operation that inserts `text` at `offset` of a buffer of `len` chars.
    pub fn insert_at(len: usize, offset: usize, text: &str) -> Self {
        Self::new()
            .retain(offset)
            .insert(text)
            .retain(len.saturating_sub(offset))
    }

    /// Operation that deletes `count` chars at `offset` of a buffer of `len` chars.
    pub fn delete_at(len: usize, offset: usize, count: usize) -> Self {
        Self::new()
            .retain(offset)
            .delete(count)
            .retain(len.saturating_sub(offset.saturating_add(count)))
    }

    pub fn retain(mut self, n: usize) -> Self {
        self.push_retain(n);
        self
    }

    pub fn insert(mut self, text: &str) -> Self {
        self.push_insert(text);
        self
    }

    pub fn delete(mut self, n: usize) -> Self {
        self.push_delete(n);
        self
    }

    /// Lengths saturate at `usize::MAX`. Decoding goes through
    /// [`Operation::try_from`], which rejects overflow instead.
    pub(crate) fn push_retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len = self.base_len.saturating_add(n);
        self.target_len = self.target_len.saturating_add(n);
        if let Some(Component::Retain(last)) = self.ops.last_mut() {
            *last = last.saturating_add(n);
        } else {
            self.ops.push(Component::Retain(n));
        }
    }

    /// Inserts always sort before a delete at the same position so that
    /// equivalent operations normalise to the same component list.
    pub(crate) fn push_insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.target_len = self.target_len.saturating_add(char_len(text));
        let len = self.ops.len();

        if let Some(Component::Insert(last)) = self.ops.last_mut() {
            last.push_str(text);
            return;
        }
        if let Some(Component::Delete(_)) = self.ops.last() {
            if len >= 2 {
                if let Component::Insert(prev) = &mut self.ops[len - 2] {
                    prev.push_str(text);
                    return;
                }
            }
            self.ops.insert(len - 1, Component::Insert(text.to_owned()));
            return;
        }
        self.ops.push(Component::Insert(text.to_owned()));
    }

    pub(crate) fn push_delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len = self.base_len.saturating_add(n);
        if let Some(Component::Delete(last)) = self.ops.last_mut() {
            *last = last.saturating_add(n);
        } else {
            self.ops.push(Component::Delete(n));
        }
    }

    /// Length of the buffer this operation must be applied to.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the buffer this operation produces.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    pub fn components(&self) -> &[Component] {
        &self.ops
    }

    /// True if applying the operation leaves every buffer unchanged.
    pub fn is_noop(&self) -> bool {
        matches!(self.ops.as_slice(), [] | [Component::Retain(_)])
    }

    /// Apply the operation to `text`.
    ///
    /// Fails with [`OtError::OutOfBounds`] when a step runs past the end of
    /// the buffer and [`OtError::LengthMismatch`] when chars are left over.
    pub fn apply(&self, text: &str) -> Result<String, OtError> {
        let available = char_len(text);
        let mut chars = text.chars();
        let mut consumed = 0usize;
        let mut out = String::with_capacity(text.len());

        for component in &self.ops {
            match component {
                Component::Retain(n) => {
                    consumed = advance(consumed, *n, available, self.base_len)?;
                    out.extend(chars.by_ref().take(*n));
                }
                Component::Insert(s) => out.push_str(s),
                Component::Delete(n) => {
                    consumed = advance(consumed, *n, available, self.base_len)?;
                    chars.by_ref().take(*n).for_each(drop);
                }
            }
        }

        if consumed != available {
            return Err(OtError::LengthMismatch { covered: consumed, available });
        }
        Ok(out)
    }

    /// Map a position in the base buffer to the equivalent position in the
    /// target buffer. Inserts at exactly `index` push it to the right.
    pub fn transform_index(&self, index: usize) -> usize {
        let mut new_index = index;
        let mut offset = 0usize;

        for component in &self.ops {
            if offset > index {
                break;
            }
            match component {
                Component::Retain(n) => offset = offset.saturating_add(*n),
                Component::Insert(s) => new_index += char_len(s),
                Component::Delete(n) => {
                    new_index -= (*n).min(index - offset);
                    offset = offset.saturating_add(*n);
                }
            }
        }
        new_index
    }
}

/// Step `consumed` forward by `n`, failing once it passes `available`.
fn advance(consumed: usize, n: usize, available: usize, needed: usize) -> Result<usize, OtError> {
    match consumed.checked_add(n) {
        Some(next) if next <= available => Ok(next),
        _ => Err(OtError::OutOfBounds { needed, available }),
    }
}

/// Normalises a raw component list, as received off the wire.
///
/// Fails with [`OtError::LengthOverflow`] if the base or target length
/// does not fit in a `usize`.
impl TryFrom<Vec<Component>> for Operation {
    type Error = OtError;

    fn try_from(components: Vec<Component>) -> Result<Self, Self::Error> {
        let mut base_len = 0usize;
        let mut target_len = 0usize;
        for component in &components {
            let (base, target) = match component {
                Component::Retain(n) => (*n, *n),
                Component::Insert(s) => (0, char_len(s)),
                Component::Delete(n) => (*n, 0),
            };
            base_len = base_len.checked_add(base).ok_or(OtError::LengthOverflow)?;
            target_len = target_len.checked_add(target).ok_or(OtError::LengthOverflow)?;
        }

        let mut op = Operation::new();
        for component in components {
            match component {
                Component::Retain(n) => op.push_retain(n),
                Component::Insert(s) => op.push_insert(&s),
                Component::Delete(n) => op.push_delete(n),
            }
        }
        Ok(op)
    }
}

impl From<Operation> for Vec<Component> {
    fn from(op: Operation) -> Self {
        op.ops
    }
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `s` after `at` chars.
pub(crate) fn split_chars(s: &str, at: usize) -> (&str, &str) {
    match s.char_indices().nth(at) {
        Some((byte, _)) => s.split_at(byte),
        None => (s, ""),
    }
}
