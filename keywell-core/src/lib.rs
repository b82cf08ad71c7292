//! Core types shared across the keywell storage engine
//!
//! This crate defines the vocabulary every other keywell crate speaks:
//! byte-oriented key and value aliases, the [`Error`] type with its
//! seven failure kinds, and the [`Visitor`] contract through which all
//! record mutations are expressed.

pub mod error;
pub mod visitor;

pub use error::{Error, ErrorKind, Result};
pub use visitor::{VisitAction, Visitor};

/// Keys are arbitrary byte strings
pub type Key = Vec<u8>;

/// Values are arbitrary byte strings
pub type Value = Vec<u8>;
