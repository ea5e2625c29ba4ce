//! Property checks for the transform engine.
//!
//! Generates operation pairs over arbitrary buffers and checks that both
//! application orders produce the same text, and that compose matches
//! sequential application.

use proptest::prelude::*;
use quill_core::{compose, transform, Operation};

/// Buffers mix ASCII with multi-byte chars so lengths are counted in chars.
const TEXT: &str = "[abc é日]";

#[derive(Clone, Debug)]
enum Step {
    Retain(usize),
    Delete(usize),
    Insert(String),
}

fn arb_text() -> impl Strategy<Value = String> {
    prop::string::string_regex(&format!("{TEXT}{{0,12}}")).unwrap()
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1..=4usize).prop_map(Step::Retain),
        (1..=4usize).prop_map(Step::Delete),
        prop::string::string_regex(&format!("{TEXT}{{1,3}}")).unwrap().prop_map(Step::Insert),
    ]
}

/// An operation over a buffer of `len` chars.
///
/// Retain and delete spans are clamped to what is left of the buffer; any
/// remainder after the last step is retained.
fn arb_op(len: usize) -> impl Strategy<Value = Operation> {
    (
        prop::collection::vec(arb_step(), 0..16),
        prop::option::of(prop::string::string_regex(&format!("{TEXT}{{1,2}}")).unwrap()),
    )
        .prop_map(move |(steps, tail)| {
            let mut op = Operation::new();
            let mut remaining = len;
            for step in steps {
                match step {
                    Step::Retain(n) => {
                        let n = n.min(remaining);
                        op = op.retain(n);
                        remaining -= n;
                    }
                    Step::Delete(n) => {
                        let n = n.min(remaining);
                        op = op.delete(n);
                        remaining -= n;
                    }
                    Step::Insert(s) => op = op.insert(&s),
                }
            }
            op = op.retain(remaining);
            if let Some(s) = tail {
                op = op.insert(&s);
            }
            op
        })
}

/// A buffer and two concurrent operations against it.
fn arb_concurrent() -> impl Strategy<Value = (String, Operation, Operation)> {
    arb_text().prop_flat_map(|base| {
        let len = base.chars().count();
        (Just(base), arb_op(len), arb_op(len))
    })
}

/// A buffer and two operations applied one after the other.
fn arb_sequential() -> impl Strategy<Value = (String, Operation, Operation)> {
    arb_text()
        .prop_flat_map(|base| {
            let len = base.chars().count();
            (Just(base), arb_op(len))
        })
        .prop_flat_map(|(base, a)| {
            let mid = a.target_len();
            (Just(base), Just(a), arb_op(mid))
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1_000))]

    #[test]
    fn prop_concurrent_pairs_converge((base, a, b) in arb_concurrent()) {
        let (a_prime, b_prime) = transform(&a, &b).unwrap();
        let left = b_prime.apply(&a.apply(&base).unwrap()).unwrap();
        let right = a_prime.apply(&b.apply(&base).unwrap()).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn prop_transform_preserves_lengths((_base, a, b) in arb_concurrent()) {
        let (a_prime, b_prime) = transform(&a, &b).unwrap();
        prop_assert_eq!(a_prime.base_len(), b.target_len());
        prop_assert_eq!(b_prime.base_len(), a.target_len());
        prop_assert_eq!(a_prime.target_len(), b_prime.target_len());
    }

    #[test]
    fn prop_compose_matches_sequential((base, a, b) in arb_sequential()) {
        let mid = a.apply(&base).unwrap();
        let ab = compose(&a, &b).unwrap();
        prop_assert_eq!(ab.base_len(), a.base_len());
        prop_assert_eq!(ab.apply(&base).unwrap(), b.apply(&mid).unwrap());
    }

    #[test]
    fn prop_apply_matches_target_len((base, a, _b) in arb_concurrent()) {
        let out = a.apply(&base).unwrap();
        prop_assert_eq!(out.chars().count(), a.target_len());
    }
}

#[test]
fn test_server_history_rebase() {
    // Three concurrent edits against revision 0, sequenced in order; each
    // later one is rebased over everything sequenced before it.
    let base = "shared note";
    let len = base.chars().count();
    let edits = [
        Operation::insert_at(len, 0, "# "),
        Operation::delete_at(len, 6, 5),
        Operation::insert_at(len, len, "!"),
    ];

    let mut doc = base.to_string();
    let mut history: Vec<Operation> = Vec::new();
    for edit in &edits {
        let mut op = edit.clone();
        for applied in &history {
            let (_, rebased) = transform(applied, &op).unwrap();
            op = rebased;
        }
        doc = op.apply(&doc).unwrap();
        history.push(op);
    }
    assert_eq!(doc, "# shared!");
}
