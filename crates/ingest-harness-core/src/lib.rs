//! # Ingest Harness Core
//!
//! Runtime-free logic shared by the ingestion pipeline: data models,
//! the text chunker, and the storage abstraction.
//!
//! This crate contains no tokio, sqlx, or network dependencies. Everything
//! here is either pure computation or an async trait that the host crate
//! implements against a concrete backend.

pub mod chunk;
pub mod models;
pub mod store;
