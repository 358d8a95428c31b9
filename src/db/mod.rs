//! Database module for upcheck.
//!
//! SQLite storage with versioned migrations, pooled connections and the
//! read-side aggregation queries.

mod aggregate;
mod incidents;
mod migrations;
mod models;
mod store;

pub use aggregate::*;
pub use incidents::*;
pub use migrations::{
    apply_migrations, latest_version, migrations, rebuild_table, schema_version, Migration,
};
pub use models::*;
pub use store::*;
