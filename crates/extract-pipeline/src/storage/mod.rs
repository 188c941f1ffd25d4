//! Storage module for persistent data storage
//!
//! Provides SQLite-based persistence for document records.

mod database;

pub use database::DocumentStore;
