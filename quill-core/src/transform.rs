//! Composition and transformation of concurrent operations.
//!
//! Both algorithms walk the component lists of two operations in lock
//! step, splitting whichever component is longer, so cost is linear in
//! the combined operation size and independent of document length.
//!
//! Tie-break: when both sides insert at the same position, the insert of
//! the operation sequenced first (the left argument of [`transform`]) is
//! placed first. Callers order the arguments by submission sequence, so
//! every replica breaks the tie the same way regardless of who sent what.

use crate::operation::{split_chars, char_len, Component, Operation, OtError};

/// Next component of `it`, or the unconsumed remainder of the current one.
fn advance<I>(it: &mut I, rest: usize, make: fn(usize) -> Component) -> Option<Component>
where
    I: Iterator<Item = Component>,
{
    if rest > 0 {
        Some(make(rest))
    } else {
        it.next()
    }
}

/// Combine `a` followed by `b` into a single operation.
///
/// `apply(apply(s, a), b) == apply(s, compose(a, b))`.
pub fn compose(a: &Operation, b: &Operation) -> Result<Operation, OtError> {
    if a.target_len() != b.base_len() {
        return Err(OtError::IncompatibleLengths {
            expected: a.target_len(),
            actual: b.base_len(),
        });
    }

    let mut out = Operation::new();
    let mut ia = a.components().iter().cloned();
    let mut ib = b.components().iter().cloned();
    let mut ca = ia.next();
    let mut cb = ib.next();

    loop {
        match (ca.take(), cb.take()) {
            (None, None) => break,

            // Deletes in `a` never reach `b`.
            (Some(Component::Delete(n)), rest) => {
                out.push_delete(n);
                ca = ia.next();
                cb = rest;
            }
            // Inserts in `b` don't consume anything from `a`.
            (rest, Some(Component::Insert(s))) => {
                out.push_insert(&s);
                ca = rest;
                cb = ib.next();
            }

            (None, _) | (_, None) => {
                return Err(OtError::IncompatibleLengths {
                    expected: a.target_len(),
                    actual: b.base_len(),
                });
            }

            (Some(Component::Retain(n)), Some(Component::Retain(m))) => {
                let len = n.min(m);
                out.push_retain(len);
                ca = advance(&mut ia, n - len, Component::Retain);
                cb = advance(&mut ib, m - len, Component::Retain);
            }
            (Some(Component::Insert(s)), Some(Component::Delete(m))) => {
                let n = char_len(&s);
                let len = n.min(m);
                ca = if n > len {
                    Some(Component::Insert(split_chars(&s, len).1.to_owned()))
                } else {
                    ia.next()
                };
                cb = advance(&mut ib, m - len, Component::Delete);
            }
            (Some(Component::Insert(s)), Some(Component::Retain(m))) => {
                let n = char_len(&s);
                let len = n.min(m);
                let (head, tail) = split_chars(&s, len);
                out.push_insert(head);
                ca = if tail.is_empty() {
                    ia.next()
                } else {
                    Some(Component::Insert(tail.to_owned()))
                };
                cb = advance(&mut ib, m - len, Component::Retain);
            }
            (Some(Component::Retain(n)), Some(Component::Delete(m))) => {
                let len = n.min(m);
                out.push_delete(len);
                ca = advance(&mut ia, n - len, Component::Retain);
                cb = advance(&mut ib, m - len, Component::Delete);
            }
        }
    }

    Ok(out)
}

/// Transform two operations computed against the same base.
///
/// Returns `(a', b')` such that
/// `apply(apply(s, a), b') == apply(apply(s, b), a')`.
/// `a` is the operation sequenced first and wins insert ties.
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    if a.base_len() != b.base_len() {
        return Err(OtError::IncompatibleLengths {
            expected: a.base_len(),
            actual: b.base_len(),
        });
    }

    let mut a_prime = Operation::new();
    let mut b_prime = Operation::new();
    let mut ia = a.components().iter().cloned();
    let mut ib = b.components().iter().cloned();
    let mut ca = ia.next();
    let mut cb = ib.next();

    loop {
        match (ca.take(), cb.take()) {
            (None, None) => break,

            (Some(Component::Insert(s)), rest) => {
                b_prime.push_retain(char_len(&s));
                a_prime.push_insert(&s);
                ca = ia.next();
                cb = rest;
            }
            (rest, Some(Component::Insert(s))) => {
                a_prime.push_retain(char_len(&s));
                b_prime.push_insert(&s);
                ca = rest;
                cb = ib.next();
            }

            (None, _) | (_, None) => {
                return Err(OtError::IncompatibleLengths {
                    expected: a.base_len(),
                    actual: b.base_len(),
                });
            }

            (Some(Component::Retain(n)), Some(Component::Retain(m))) => {
                let len = n.min(m);
                a_prime.push_retain(len);
                b_prime.push_retain(len);
                ca = advance(&mut ia, n - len, Component::Retain);
                cb = advance(&mut ib, m - len, Component::Retain);
            }
            // Both deleted the same span: nothing left to do on either side.
            (Some(Component::Delete(n)), Some(Component::Delete(m))) => {
                let len = n.min(m);
                ca = advance(&mut ia, n - len, Component::Delete);
                cb = advance(&mut ib, m - len, Component::Delete);
            }
            (Some(Component::Delete(n)), Some(Component::Retain(m))) => {
                let len = n.min(m);
                a_prime.push_delete(len);
                ca = advance(&mut ia, n - len, Component::Delete);
                cb = advance(&mut ib, m - len, Component::Retain);
            }
            (Some(Component::Retain(n)), Some(Component::Delete(m))) => {
                let len = n.min(m);
                b_prime.push_delete(len);
                ca = advance(&mut ia, n - len, Component::Retain);
                cb = advance(&mut ib, m - len, Component::Delete);
            }
        }
    }

    Ok((a_prime, b_prime))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converge(base: &str, a: &Operation, b: &Operation) -> String {
        let (a_prime, b_prime) = transform(a, b).unwrap();
        let left = b_prime.apply(&a.apply(base).unwrap()).unwrap();
        let right = a_prime.apply(&b.apply(base).unwrap()).unwrap();
        assert_eq!(left, right, "replicas diverged for {a:?} / {b:?}");
        left
    }

    #[test]
    fn test_compose_sequential_equivalence() {
        let base = "hello world";
        let a = Operation::new().retain(5).insert(",").retain(6);
        let b = Operation::new().delete(1).insert("H").retain(11);
        let ab = compose(&a, &b).unwrap();
        assert_eq!(ab.apply(base).unwrap(), b.apply(&a.apply(base).unwrap()).unwrap());
        assert_eq!(ab.apply(base).unwrap(), "Hello, world");
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let a = Operation::new().retain(2).insert("xyz");
        let b = Operation::new().retain(2).delete(3);
        let ab = compose(&a, &b).unwrap();
        assert!(ab.is_noop());
        assert_eq!(ab.apply("ab").unwrap(), "ab");
    }

    #[test]
    fn test_compose_partial_insert_overlap() {
        let base = "abc";
        let a = Operation::new().retain(1).insert("1234").retain(2);
        let b = Operation::new().retain(3).delete(2).retain(2);
        let ab = compose(&a, &b).unwrap();
        assert_eq!(ab.apply(base).unwrap(), "a12bc");
    }

    #[test]
    fn test_compose_incompatible_lengths() {
        let a = Operation::new().retain(3).insert("x");
        let b = Operation::new().retain(3);
        assert_eq!(
            compose(&a, &b),
            Err(OtError::IncompatibleLengths { expected: 4, actual: 3 })
        );
    }

    #[test]
    fn test_transform_same_offset_insert_tie_break() {
        let x = Operation::insert_at(2, 1, "X");
        let y = Operation::insert_at(2, 1, "Y");
        assert_eq!(converge("AB", &x, &y), "AXYB");
        assert_eq!(converge("AB", &y, &x), "AYXB");
    }

    #[test]
    fn test_transform_insert_vs_delete() {
        let ins = Operation::insert_at(5, 2, "__");
        let del = Operation::delete_at(5, 1, 3);
        assert_eq!(converge("hello", &ins, &del), "h__o");
        assert_eq!(converge("hello", &del, &ins), "h__o");
    }

    #[test]
    fn test_transform_overlapping_deletes() {
        let a = Operation::delete_at(6, 1, 3);
        let b = Operation::delete_at(6, 2, 3);
        assert_eq!(converge("abcdef", &a, &b), "af");
    }

    #[test]
    fn test_transform_identical_deletes() {
        let a = Operation::delete_at(3, 0, 3);
        let (a_prime, b_prime) = transform(&a, &a).unwrap();
        assert!(a_prime.is_noop());
        assert!(b_prime.is_noop());
    }

    #[test]
    fn test_transform_disjoint_edits() {
        let a = Operation::new().insert(">> ").retain(11);
        let b = Operation::new().retain(6).delete(5).insert("there");
        assert_eq!(converge("hello world", &a, &b), ">> hello there");
    }

    #[test]
    fn test_transform_against_noop() {
        let a = Operation::insert_at(3, 3, "!");
        let noop = Operation::identity(3);
        let (a_prime, noop_prime) = transform(&a, &noop).unwrap();
        assert_eq!(a_prime, a);
        assert_eq!(noop_prime, Operation::identity(4));
    }

    #[test]
    fn test_transform_incompatible_base() {
        let a = Operation::identity(3);
        let b = Operation::identity(4);
        assert!(matches!(transform(&a, &b), Err(OtError::IncompatibleLengths { .. })));
    }

    #[test]
    fn test_transform_unicode() {
        let a = Operation::insert_at(3, 1, "ß");
        let b = Operation::delete_at(3, 0, 2);
        assert_eq!(converge("日本語", &a, &b), "ß語");
    }

    #[test]
    fn test_transform_exhaustive_small_edits() {
        // Every single-char insert/delete pair over a short buffer.
        let base = "abcd";
        let len = base.chars().count();
        let mut ops = Vec::new();
        for offset in 0..=len {
            ops.push(Operation::insert_at(len, offset, "X"));
            ops.push(Operation::insert_at(len, offset, "YZ"));
            if offset < len {
                ops.push(Operation::delete_at(len, offset, 1));
                ops.push(Operation::delete_at(len, offset, len - offset));
            }
        }
        for a in &ops {
            for b in &ops {
                converge(base, a, b);
            }
        }
    }
}
