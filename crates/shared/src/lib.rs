#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! MediaMart shared types and database helpers
//!
//! Used by the billing library, the API server and the background worker.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{
    cents_to_display, CostType, MembershipTier, PurchaseStatus, QUOTA_PERIOD_DAYS,
};
