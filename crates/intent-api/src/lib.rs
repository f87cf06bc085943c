//! Factory intent API: library crate for the HTTP surface.
//!
//! Re-exports all modules so the binary (`main.rs`) and external crates
//! (e.g. `intent-e2e-tests`) can reach `AppState`, `build_router` and the
//! Postgres stores.

pub mod bedrock;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
