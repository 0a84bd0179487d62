//! Items matcher: remote inventory listing and active trade matching.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod backend;
pub mod config;
pub mod engine;
pub mod platform;
pub mod storage;
pub mod types;
