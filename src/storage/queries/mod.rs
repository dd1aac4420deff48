//! Database query modules for CRUD operations.
//!
//! Each module provides async functions that operate on the database.

pub mod messages;
