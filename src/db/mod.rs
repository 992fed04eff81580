//! Durable store over SQLite.
//!
//! `repo` holds the queries, each taking the pool explicitly; `model` turns
//! rows into domain entities and rejects unknown status or kind strings.
//! Callers use the flat `db::*` surface.

pub mod model;
pub mod repo;

pub use repo::*;
