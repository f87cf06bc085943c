//! Deterministic slot extraction for factory queries.
//!
//! Recognizes entity identifiers, time ranges, ranking / period-comparison
//! markers, numeric qualifiers, metrics, departments, statuses and person
//! names, and renders a normalized form with `{SLOT_TYPE}` placeholders.

pub mod comparison;
pub mod entities;
pub mod extractor;
pub mod numerals;
pub mod span;
pub mod time_range;

pub use extractor::SlotExtractor;
