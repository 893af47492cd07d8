//! Run summary
//!
//! Every form, and every repeat group within it, gets its own outcome. A
//! failure in one never hides the others.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failure => "failure",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one form or repeat group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    NoData,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub fetched: usize,
    pub upserted: usize,
    /// Records dropped before writing: no key, orphaned or malformed
    pub dropped: usize,
    /// Records collapsed into a later record with the same key
    pub duplicates: usize,
    /// Records the store rejected
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupOutcome {
    /// Source path of the group, e.g. `household_members/visits`
    pub path: String,
    pub target: String,
    pub declared: bool,
    pub status: UnitStatus,
    pub counts: RecordCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-record failures reported by the store
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
}

impl GroupOutcome {
    pub fn is_clean(&self) -> bool {
        self.status != UnitStatus::Failed && self.counts.failed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormOutcome {
    pub form_id: String,
    pub target: String,
    pub status: UnitStatus,
    pub counts: RecordCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Field-tree lookup failed; only declared groups were processed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_error: Option<String>,
    /// Per-record failures reported by the store
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
    pub groups: Vec<GroupOutcome>,
}

impl FormOutcome {
    pub fn new(form_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            form_id: form_id.into(),
            target: target.into(),
            status: UnitStatus::NoData,
            counts: RecordCounts::default(),
            error: None,
            discovery_error: None,
            rejected: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = UnitStatus::Failed;
        self.error = Some(error.into());
        self
    }

    /// Form and every group written without a failure
    pub fn is_clean(&self) -> bool {
        self.status != UnitStatus::Failed
            && self.counts.failed == 0
            && self.discovery_error.is_none()
            && self.groups.iter().all(GroupOutcome::is_clean)
    }

    pub fn failed_groups(&self) -> impl Iterator<Item = &GroupOutcome> {
        self.groups.iter().filter(|g| !g.is_clean())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub pipeline: String,
    pub source: String,
    pub sink: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub forms: Vec<FormOutcome>,
}

impl RunSummary {
    /// Success when everything is clean, failure when no form got through
    pub fn aggregate(forms: &[FormOutcome]) -> RunStatus {
        if forms.iter().all(FormOutcome::is_clean) {
            RunStatus::Success
        } else if forms.iter().all(|f| f.status == UnitStatus::Failed) {
            RunStatus::Failure
        } else {
            RunStatus::PartialFailure
        }
    }

    /// Process exit code for the scheduler
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Success => 0,
            RunStatus::PartialFailure | RunStatus::Failure => 1,
        }
    }

    pub fn totals(&self) -> RecordCounts {
        let mut totals = RecordCounts::default();
        let all = self
            .forms
            .iter()
            .flat_map(|f| std::iter::once(&f.counts).chain(f.groups.iter().map(|g| &g.counts)));
        for counts in all {
            totals.fetched += counts.fetched;
            totals.upserted += counts.upserted;
            totals.dropped += counts.dropped;
            totals.duplicates += counts.duplicates;
            totals.failed += counts.failed;
        }
        totals
    }

    /// Human-readable lines describing what did not go through
    pub fn details(&self) -> String {
        let totals = self.totals();
        let mut lines = vec![format!(
            "{} form(s), {} record(s) upserted, {} dropped, {} failed",
            self.forms.len(),
            totals.upserted,
            totals.dropped,
            totals.failed
        )];

        for form in &self.forms {
            if let Some(error) = &form.error {
                lines.push(format!("form {}: {}", form.form_id, error));
            } else if form.counts.failed > 0 {
                lines.push(format!("form {}: {} record(s) rejected", form.form_id, form.counts.failed));
                lines.extend(form.rejected.iter().map(|r| format!("form {}: rejected {}", form.form_id, r)));
            }
            if let Some(error) = &form.discovery_error {
                lines.push(format!("form {}: repeat-group discovery failed: {}", form.form_id, error));
            }
            for group in form.failed_groups() {
                match &group.error {
                    Some(error) => lines.push(format!("group {}/{}: {}", form.form_id, group.path, error)),
                    None => {
                        lines.push(format!(
                            "group {}/{}: {} record(s) rejected",
                            form.form_id, group.path, group.counts.failed
                        ));
                        lines.extend(
                            group
                                .rejected
                                .iter()
                                .map(|r| format!("group {}/{}: rejected {}", form.form_id, group.path, r)),
                        );
                    },
                }
            }
        }

        lines.join("\n")
    }
}
