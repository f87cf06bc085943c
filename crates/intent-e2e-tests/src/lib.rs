//! End-to-end tests for the intent pipeline.
//!
//! This crate has no library code; the tests under `tests/` drive the slot
//! extractor, the pipeline and the HTTP router together over in-memory
//! stores and mock model services.
