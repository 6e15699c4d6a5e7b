//! Context retrieval: the contract the orchestrator consumes and a
//! schema-backed default implementation.

pub mod retriever;

pub use retriever::*;
