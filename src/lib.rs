//!
//! src/lib.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Album ingest pipeline: load album exports, enrich them from music
//! catalogs, store and index the results
//!

pub mod album;
pub mod app;
pub mod batch;
pub mod cli;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod gateway;
pub mod index;
pub mod loader;
pub mod logging;
pub mod persistent;
pub mod reconcile;
pub mod sink;
pub mod sources;
