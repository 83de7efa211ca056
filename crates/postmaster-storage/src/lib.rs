//! Postmaster Storage - database access for rule groups and mail accounts
//!
//! Rule groups live in the `postmaster_filter` table as one row per
//! clause; this crate folds them back into [`PostmasterFilter`] values.

pub mod db;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
