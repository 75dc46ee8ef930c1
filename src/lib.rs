//! Schema catalog and DDL execution over sled-backed relations.
//!
//! SQL text is parsed into a [`parse::Statement`], executed by
//! [`sql::SqlExec`] against the self-describing catalog in [`schema`], and
//! returned as a [`result::QueryResult`].

pub mod error;
pub mod model;
pub mod parse;
pub mod result;
pub mod schema;
pub mod shell;
pub mod sql;
pub mod store;
