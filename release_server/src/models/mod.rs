//! Release tracking data models, split by aggregate.

pub mod commit;
pub mod group;
pub mod project;
pub mod release;
