//! Catalog-enrichment pipeline backend library.
//!
//! Exposes the domain, pipeline, and API modules for the binary and the
//! integration tests.

pub mod analyst;
pub mod api;
pub mod auth;
pub mod cache;
pub mod confidence;
pub mod crossval;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod scoring;
pub mod source_map;
pub mod storage;
pub mod validation;
