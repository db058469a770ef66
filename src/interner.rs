//! Process-wide string interning.
//!
//! The original source compares registered-method lookups by the identity of
//! `grpc_mdstr`s interned in a per-channel `grpc_mdctx`. This crate has no
//! metadata-string context of its own, so it plays the same role with a
//! single process-wide table handing back a stable `Arc<str>` per distinct
//! string — two calls that intern the same text get pointer-equal handles,
//! so probe-table lookups can compare with `Arc::ptr_eq` instead of a string
//! compare on every probe (see `channel::ProbeTable`).

use std::sync::Arc;

use dashmap::DashMap;

/// Hands out a stable `Arc<str>` per distinct string value.
#[derive(Default)]
pub struct Interner {
    table: DashMap<Box<str>, Arc<str>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `value`, returning a handle that is pointer-equal to every
    /// other handle interned from the same text.
    pub fn intern(&self, value: &str) -> Arc<str> {
        if let Some(existing) = self.table.get(value) {
            return existing.clone();
        }
        self.table
            .entry(Box::from(value))
            .or_insert_with(|| Arc::from(value))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_text_interns_to_the_same_pointer() {
        let interner = Interner::new();
        let a = interner.intern("/svc/Method");
        let b = interner.intern("/svc/Method");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_text_interns_distinctly() {
        let interner = Interner::new();
        let a = interner.intern("/svc/A");
        let b = interner.intern("/svc/B");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
