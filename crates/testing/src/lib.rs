//! # sagastore-testing
//!
//! Testing utilities for sagastore with in-memory implementations.
//! Provides [`InMemoryDocumentContainer`], [`InMemoryTableScan`], and
//! shared saga fixtures. The crate's own test suite drives the persister
//! and the export pipeline end to end over these backends.

pub mod fixtures;
pub mod memory_container;
pub mod memory_table;

pub use memory_container::{InMemoryContainerError, InMemoryDocumentContainer};
pub use memory_table::{InMemoryScanError, InMemoryTableScan};
