//! Visitor contract for record access
//!
//! Every read and mutation in the engine reduces to dispatching a
//! visitor against a key. The engine looks the key up, then calls
//! exactly one of the two methods:
//!
//! - [`Visitor::visit_full`] when a record exists — the value handed in
//!   is already decompressed
//! - [`Visitor::visit_empty`] when it does not
//!
//! The returned [`VisitAction`] tells the engine what to do with the
//! slot. A read-only dispatch must return [`VisitAction::Nop`]; the
//! engine rejects anything else.
//!
//! # Example
//!
//! ```
//! use keywell_core::{VisitAction, Visitor};
//!
//! /// Counts how many of the probed keys exist.
//! struct Prober {
//!     hits: usize,
//! }
//!
//! impl Visitor for Prober {
//!     fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> VisitAction {
//!         self.hits += 1;
//!         VisitAction::Nop
//!     }
//! }
//! ```

use crate::Value;

/// Decision returned by a visitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitAction {
    /// Leave the record as it is
    Nop,
    /// Remove the record
    Remove,
    /// Replace the value (or insert, when the record did not exist)
    Replace(Value),
}

/// Polymorphic record access
///
/// Both methods default to [`VisitAction::Nop`] so implementors only
/// override the side they care about.
pub trait Visitor {
    /// Called with the key and its current value when the record exists
    fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> VisitAction {
        VisitAction::Nop
    }

    /// Called with the key when no record exists
    fn visit_empty(&mut self, _key: &[u8]) -> VisitAction {
        VisitAction::Nop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        full: bool,
        empty: bool,
    }

    impl Visitor for Recorder {
        fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> VisitAction {
            self.full = true;
            VisitAction::Remove
        }

        fn visit_empty(&mut self, _key: &[u8]) -> VisitAction {
            self.empty = true;
            VisitAction::Replace(b"new".to_vec())
        }
    }

    #[test]
    fn default_methods_return_nop() {
        struct Silent;
        impl Visitor for Silent {}

        let mut v = Silent;
        assert_eq!(v.visit_full(b"k", b"v"), VisitAction::Nop);
        assert_eq!(v.visit_empty(b"k"), VisitAction::Nop);
    }

    #[test]
    fn overridden_methods_are_dispatched() {
        let mut v = Recorder {
            full: false,
            empty: false,
        };
        assert_eq!(v.visit_full(b"k", b"v"), VisitAction::Remove);
        assert_eq!(v.visit_empty(b"k"), VisitAction::Replace(b"new".to_vec()));
        assert!(v.full);
        assert!(v.empty);
    }
}
