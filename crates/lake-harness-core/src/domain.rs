//! Cross-connector domain schema.
//!
//! Converters of every connector emit these rows. Entity ids come from
//! [`DomainIdGenerator`](crate::didgen::DomainIdGenerator); edge rows are
//! keyed by the ids they connect.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Lineage;
use crate::row::{Row, StoredRow};

/// Normalized issue statuses.
pub mod status {
    pub const TODO: &str = "TODO";
    pub const IN_PROGRESS: &str = "IN_PROGRESS";
    pub const DONE: &str = "DONE";
    pub const OTHER: &str = "OTHER";
}

/// Normalized issue types.
pub mod issue_type {
    pub const REQUIREMENT: &str = "REQUIREMENT";
    pub const BUG: &str = "BUG";
    pub const INCIDENT: &str = "INCIDENT";
    pub const TASK: &str = "TASK";
    pub const SUBTASK: &str = "SUBTASK";
}

/// Normalized sprint statuses.
pub mod sprint_status {
    pub const ACTIVE: &str = "ACTIVE";
    pub const CLOSED: &str = "CLOSED";
    pub const FUTURE: &str = "FUTURE";
}

macro_rules! impl_row {
    ($ty:ident, $table:literal, |$this:ident| $key:expr) => {
        impl Row for $ty {
            const TABLE: &'static str = $table;

            fn primary_key(&$this) -> String {
                $key
            }

            fn lineage(&self) -> &Lineage {
                &self.lineage
            }

            fn lineage_mut(&mut self) -> &mut Lineage {
                &mut self.lineage
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub user_name: String,
    pub full_name: String,
    pub email: String,
    pub avatar_url: String,
    pub created_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(Account, "accounts", |self| self.id.clone());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub name: String,
    pub description: String,
    pub url: String,
    /// Connector-specific board kind (`"scrum"`, `"kanban"`, `"project"`).
    #[serde(rename = "type")]
    pub board_type: String,
    pub created_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(Board, "boards", |self| self.id.clone());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub url: String,
    pub issue_key: String,
    pub title: String,
    pub description: String,
    /// One of [`issue_type`].
    #[serde(rename = "type")]
    pub issue_type: String,
    pub original_type: String,
    /// One of [`status`].
    pub status: String,
    pub original_status: String,
    pub story_point: Option<f64>,
    pub priority: String,
    pub creator_id: String,
    pub assignee_id: String,
    pub parent_issue_id: String,
    pub created_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
    pub resolution_date: Option<DateTime<Utc>>,
    pub lead_time_minutes: Option<i64>,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(Issue, "issues", |self| self.id.clone());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueChangelog {
    pub id: String,
    pub issue_id: String,
    pub author_id: String,
    pub field_name: String,
    pub original_from_value: String,
    pub original_to_value: String,
    pub created_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(IssueChangelog, "issue_changelogs", |self| self.id.clone());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: String,
    pub issue_id: String,
    pub account_id: String,
    pub body: String,
    pub created_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(IssueComment, "issue_comments", |self| self.id.clone());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    pub id: String,
    pub name: String,
    pub url: String,
    /// One of [`sprint_status`].
    pub status: String,
    pub original_status: String,
    pub original_board_id: String,
    pub started_date: Option<DateTime<Utc>>,
    pub ended_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(Sprint, "sprints", |self| self.id.clone());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardIssue {
    pub board_id: String,
    pub issue_id: String,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(BoardIssue, "board_issues", |self| format!(
    "{}|{}",
    self.board_id, self.issue_id
));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SprintIssue {
    pub sprint_id: String,
    pub issue_id: String,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(SprintIssue, "sprint_issues", |self| format!(
    "{}|{}",
    self.sprint_id, self.issue_id
));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardSprint {
    pub board_id: String,
    pub sprint_id: String,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(BoardSprint, "board_sprints", |self| format!(
    "{}|{}",
    self.board_id, self.sprint_id
));

/// Link between an issue and a commit that mentions it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueCommit {
    pub issue_id: String,
    pub commit_sha: String,
    #[serde(flatten)]
    pub lineage: Lineage,
}
impl_row!(IssueCommit, "issue_commits", |self| format!(
    "{}|{}",
    self.issue_id, self.commit_sha
));

macro_rules! domain_rows {
    ($($variant:ident),+ $(,)?) => {
        /// Any domain row, as emitted by a converter.
        #[derive(Debug, Clone, PartialEq)]
        pub enum DomainRow {
            $($variant($variant)),+
        }

        impl DomainRow {
            /// Destination table.
            pub fn table(&self) -> &'static str {
                match self {
                    $(DomainRow::$variant(_) => $variant::TABLE),+
                }
            }

            pub fn primary_key(&self) -> String {
                match self {
                    $(DomainRow::$variant(row) => row.primary_key()),+
                }
            }

            pub fn lineage(&self) -> &Lineage {
                match self {
                    $(DomainRow::$variant(row) => row.lineage()),+
                }
            }

            pub fn lineage_mut(&mut self) -> &mut Lineage {
                match self {
                    $(DomainRow::$variant(row) => row.lineage_mut()),+
                }
            }

            pub fn to_stored(&self) -> Result<StoredRow> {
                match self {
                    $(DomainRow::$variant(row) => StoredRow::from_row(row)),+
                }
            }
        }

        $(
            impl From<$variant> for DomainRow {
                fn from(row: $variant) -> Self {
                    DomainRow::$variant(row)
                }
            }
        )+

        /// Every domain table, in declaration order.
        pub const DOMAIN_TABLES: &[&str] = &[$($variant::TABLE),+];
    };
}

domain_rows!(
    Account,
    Board,
    Issue,
    IssueChangelog,
    IssueComment,
    Sprint,
    BoardIssue,
    SprintIssue,
    BoardSprint,
    IssueCommit,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_keys_join_both_ends() {
        let edge = BoardIssue {
            board_id: "zentao:ZentaoProduct:1:3".into(),
            issue_id: "zentao:ZentaoStory:1:9".into(),
            lineage: Lineage::default(),
        };
        assert_eq!(edge.primary_key(), "zentao:ZentaoProduct:1:3|zentao:ZentaoStory:1:9");
    }

    #[test]
    fn domain_row_dispatches_to_variant() {
        let mut row: DomainRow = Issue {
            id: "github:Issue:1:42".into(),
            title: "Crash on start".into(),
            issue_type: issue_type::BUG.into(),
            status: status::TODO.into(),
            ..Default::default()
        }
        .into();
        assert_eq!(row.table(), "issues");
        assert_eq!(row.primary_key(), "github:Issue:1:42");

        row.lineage_mut().raw_id = 5;
        let stored = row.to_stored().unwrap();
        assert_eq!(stored.lineage.raw_id, 5);
        assert_eq!(stored.data["type"], "BUG");

        let decoded: Issue = stored.decode().unwrap();
        assert_eq!(decoded.title, "Crash on start");
    }

    #[test]
    fn domain_tables_are_unique() {
        let mut tables = DOMAIN_TABLES.to_vec();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), DOMAIN_TABLES.len());
        assert!(DOMAIN_TABLES.contains(&"issue_commits"));
    }
}
