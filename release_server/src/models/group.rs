//! Issue groups and the rows linking them to commits, pull requests and releases.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{group_inbox, group_links, group_releases, group_resolutions, issue_groups};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(GroupStatus {
    Unresolved => "unresolved",
    Resolved => "resolved",
    Ignored => "ignored",
});

string_enum!(LinkedType {
    Commit => "commit",
    PullRequest => "pull_request",
});

string_enum!(Relationship {
    Resolves => "resolves",
    References => "references",
});

string_enum!(ResolutionType {
    InRelease => "in_release",
    InNextRelease => "in_next_release",
});

string_enum!(ResolutionStatus {
    Pending => "pending",
    Resolved => "resolved",
});

string_enum!(InboxRemoveAction {
    Resolved => "resolved",
    Ignored => "ignored",
    MarkReviewed => "mark_reviewed",
});

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = issue_groups)]
pub struct Group {
    pub id: i64,
    pub project_id: i64,
    pub status: String,
    pub first_release_id: Option<i64>,
}

impl Group {
    pub fn status(&self) -> Option<GroupStatus> {
        GroupStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = group_links)]
pub struct GroupLink {
    pub id: i64,
    pub group_id: i64,
    pub project_id: i64,
    pub linked_type: String,
    pub linked_id: i64,
    pub relationship: String,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = group_links)]
pub struct NewGroupLink {
    pub group_id: i64,
    pub project_id: i64,
    pub linked_type: &'static str,
    pub linked_id: i64,
    pub relationship: &'static str,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = group_resolutions)]
pub struct GroupResolution {
    pub id: i64,
    pub group_id: i64,
    pub release_id: i64,
    pub resolution_type: String,
    pub status: String,
    pub actor_id: Option<i64>,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = group_resolutions, treat_none_as_null = true)]
pub struct NewGroupResolution {
    pub group_id: i64,
    pub release_id: i64,
    pub resolution_type: &'static str,
    pub status: &'static str,
    pub actor_id: Option<i64>,
    pub date_added: DateTime<Utc>,
}

impl NewGroupResolution {
    /// A resolution that takes effect in `release_id` immediately.
    pub fn in_release(group_id: i64, release_id: i64, actor_id: Option<i64>) -> Self {
        Self {
            group_id,
            release_id,
            resolution_type: ResolutionType::InRelease.as_str(),
            status: ResolutionStatus::Resolved.as_str(),
            actor_id,
            date_added: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = group_inbox)]
pub struct GroupInbox {
    pub id: i64,
    pub group_id: i64,
    pub project_id: i64,
    pub reason: String,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = group_releases)]
pub struct GroupRelease {
    pub id: i64,
    pub project_id: i64,
    pub group_id: i64,
    pub release_id: i64,
    pub environment: String,
}

/// An issue the cascade should resolve, with the commit author to credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionCandidate {
    pub group_id: i64,
    pub author_id: Option<i64>,
}

/// Drops repeated groups, keeping the first candidate for each.
pub fn dedupe_by_group(candidates: Vec<ResolutionCandidate>) -> Vec<ResolutionCandidate> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.group_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_enums_round_trip_through_columns() {
        assert_eq!(LinkedType::PullRequest.as_str(), "pull_request");
        assert_eq!(LinkedType::parse("commit"), Some(LinkedType::Commit));
        assert_eq!(GroupStatus::parse("muted"), None);
        assert_eq!(ResolutionType::InNextRelease.to_string(), "in_next_release");
    }

    #[test]
    fn dedupe_keeps_first_candidate() {
        let candidates = vec![
            ResolutionCandidate { group_id: 1, author_id: Some(10) },
            ResolutionCandidate { group_id: 2, author_id: None },
            ResolutionCandidate { group_id: 1, author_id: Some(11) },
        ];
        let deduped = dedupe_by_group(candidates);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0], ResolutionCandidate { group_id: 1, author_id: Some(10) });
    }

    #[test]
    fn resolution_in_release_is_resolved() {
        let resolution = NewGroupResolution::in_release(4, 9, None);
        assert_eq!(resolution.resolution_type, "in_release");
        assert_eq!(resolution.status, "resolved");
    }
}
