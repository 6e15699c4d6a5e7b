//! Query security: the lexical rule chain applied to generated SQL before
//! anything reaches the data store.

pub mod sql_guard;

pub use sql_guard::*;
