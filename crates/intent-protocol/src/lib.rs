//! Shared types for the factory intent resolution pipeline.
//!
//! Everything that crosses a crate boundary (slot extraction output, ladder
//! results, conversation sessions, preview tokens, learning samples) lives
//! here so the extractor, pipeline and HTTP surface agree on one model.

pub mod conversation;
pub mod intent;
pub mod learning;
pub mod preview;
pub mod query;
pub mod slots;

pub use conversation::*;
pub use intent::*;
pub use learning::*;
pub use preview::*;
pub use query::*;
pub use slots::*;
