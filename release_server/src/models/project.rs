//! Project — the owner of issues; releases are associated to projects.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::projects;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = projects)]
pub struct Project {
    pub id: i64,
    pub organization_id: i64,
    pub slug: String,
    pub has_releases: bool,
}
