//! Release tracking and release–commit reconciliation.
//!
//! Binds commit lists from any number of repositories to a release,
//! deduplicates authors, and resolves the issues those commits (or the pull
//! requests they merged) fix. Commit binding is serialized per release with a
//! lease lock; everything else relies on store transactions and atomic
//! insert-or-ignore primitives.

pub mod cache;
pub mod config;
pub mod error;
pub mod external;
pub mod lock;
pub mod metrics;
pub mod migration;
pub mod models;
pub mod queue;
pub mod schema;
pub mod services;
pub mod signals;
pub mod store;

pub use error::{ReleaseError, ReleaseResult, StoreError};
pub use services::{Backends, Collaborators, ReleaseServices};
