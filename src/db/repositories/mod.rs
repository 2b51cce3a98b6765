//! Query methods on [`Database`](crate::db::Database), one file per table.

pub mod metrics;
pub mod sessions;
