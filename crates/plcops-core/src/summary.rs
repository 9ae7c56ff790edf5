//! Per-tier outcomes and the end-of-run summary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TierKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TierStatus {
    Ok,
    Fail,
}

impl fmt::Display for TierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierStatus::Ok => f.write_str("OK"),
            TierStatus::Fail => f.write_str("FAIL"),
        }
    }
}

/// Result of one tier's flow within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub tier: TierKind,
    pub status: TierStatus,
    pub note: String,
}

impl Outcome {
    pub fn ok(tier: TierKind, note: impl Into<String>) -> Self {
        Self {
            tier,
            status: TierStatus::Ok,
            note: note.into(),
        }
    }

    pub fn fail(tier: TierKind, note: impl Into<String>) -> Self {
        Self {
            tier,
            status: TierStatus::Fail,
            note: note.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == TierStatus::Ok
    }

    /// `<tier>: <OK|FAIL> - <note>`
    pub fn line(&self) -> String {
        format!("{}: {} - {}", self.tier, self.status, self.note)
    }
}

/// Everything a run produced, in tier order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Branch checked out before the run, restored afterwards.
    pub start_branch: Option<String>,
    pub outcomes: Vec<Outcome>,
}

impl RunSummary {
    pub fn overall_ok(&self) -> bool {
        self.outcomes.iter().all(Outcome::is_ok)
    }

    pub fn outcome(&self, tier: TierKind) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.tier == tier)
    }

    pub fn lines(&self) -> Vec<String> {
        self.outcomes.iter().map(Outcome::line).collect()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
