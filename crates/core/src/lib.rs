//! dictgen-core
//!
//! Recovers the strings a binary's functions reference and turns them into an
//! AFL-style fuzzer dictionary.
//!
//! Analysis engines live behind [`services::analysis::AnalysisBackend`]; the
//! rest of the pipeline (resource guard, extraction, filtering, escaping,
//! writing) is engine-agnostic so frontends only wire configuration together.

pub mod config;
pub mod dictionary;
pub mod guard;
pub mod pipeline;
pub mod services;

