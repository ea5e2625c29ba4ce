//! Derived CRDT replica of a document.
//!
//! The OT buffer stays authoritative. When enabled, every applied operation
//! is replayed into a `yrs` text so clients that speak Yjs can bootstrap
//! from an encoded state update. Nothing ever flows back from the mirror.

use yrs::{Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact};

use quill_core::{Component, Operation};

const TEXT_NAME: &str = "content";

pub struct CrdtMirror {
    doc: Doc,
    text: TextRef,
}

impl CrdtMirror {
    pub fn new(content: &str) -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_NAME);
        if !content.is_empty() {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, content);
        }
        Self { doc, text }
    }

    /// Replay `op`, which was just applied to `before`.
    pub fn apply(&mut self, before: &str, op: &Operation) {
        let mut source = before.chars();
        let mut pos: u32 = 0;
        let mut txn = self.doc.transact_mut();

        for component in op.components() {
            match component {
                Component::Retain(n) => {
                    pos += byte_len(&mut source, *n);
                }
                Component::Insert(s) => {
                    self.text.insert(&mut txn, pos, s);
                    pos += s.len() as u32;
                }
                Component::Delete(n) => {
                    let bytes = byte_len(&mut source, *n);
                    self.text.remove_range(&mut txn, pos, bytes);
                }
            }
        }
    }

    /// Full state as a v1 update, applicable to an empty `yrs::Doc`.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }
}

fn byte_len(chars: &mut std::str::Chars<'_>, n: usize) -> u32 {
    chars.by_ref().take(n).map(|c| c.len_utf8() as u32).sum()
}
