//! # Lacework lease storage
//!
//! Durable storage for overlay subnet leases over PostgreSQL, MySQL or SQLite.
//!
//! One row per underlay host. The underlay address, the overlay subnet and the
//! hardware address are each unique, and those constraints are what keep two
//! hosts from ever holding the same block, across any number of controllers
//! sharing the database.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lacework_common::DatabaseConfig;
//! use lacework_store::{Database, LeaseRepository, LeaseStore};
//!
//! # async fn example() -> lacework_store::Result<()> {
//! let db = Database::connect(&DatabaseConfig::default()).await?;
//! let repo = LeaseRepository::new(db);
//! repo.migrate().await?;
//!
//! for lease in repo.all_active(3600).await? {
//!     println!("{} -> {}", lease.underlay_ip, lease.overlay_subnet);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod database;
pub mod deleter;
pub mod dialect;
pub mod migrations;
pub mod repository;

mod error;
mod metrics;

pub use database::{Database, SqlTransaction, SqlValue, Transaction};
pub use deleter::{Deleter, SubnetDeleter};
pub use dialect::Dialect;
pub use error::{Result, StoreError};
pub use metrics::{StoreMetrics, TransactionOutcome};
pub use repository::{LeaseRepository, LeaseStore};
