//! Core domain model for persona-attribution reconciliation runs.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "opar-core";

/// One outbound send observed for a lead, with the resolved sender identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaEvent {
    pub persona_name: String,
    pub persona_email: String,
    pub timestamp: DateTime<Utc>,
}

/// Earliest/latest persona-contact summary accumulated for one lead.
///
/// Keyed by the lowercased lead address; `original_emails` keeps every
/// case-variant seen so the store lookup can match records however they
/// were entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadAggregate {
    pub lead_email: String,
    pub original_emails: BTreeSet<String>,
    pub earliest: Option<PersonaEvent>,
    pub latest: Option<PersonaEvent>,
}

impl LeadAggregate {
    pub fn new(lead_email: &str) -> Self {
        Self {
            lead_email: lead_email.to_lowercase(),
            original_emails: BTreeSet::new(),
            earliest: None,
            latest: None,
        }
    }

    /// Fold one event into the aggregate. Strict timestamp comparison:
    /// ties keep the first-seen event.
    pub fn observe(&mut self, original_email: &str, event: PersonaEvent) {
        self.original_emails.insert(original_email.to_string());
        match &self.earliest {
            Some(current) if event.timestamp >= current.timestamp => {}
            _ => self.earliest = Some(event.clone()),
        }
        match &self.latest {
            Some(current) if event.timestamp <= current.timestamp => {}
            _ => self.latest = Some(event),
        }
    }
}

/// Raw, pre-validation window parameters as received from a trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowParams {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub days_back: Option<i64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid {field} {value:?}: expected YYYY-MM-DD")]
    BadDate { field: &'static str, value: String },
    #[error("days_back must be between 1 and 90, got {0}")]
    DaysBackOutOfRange(i64),
    #[error("window start {from} is after window end {to}")]
    Inverted { from: NaiveDate, to: NaiveDate },
}

/// Inclusive UTC day range a run reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl SyncWindow {
    /// Resolve request parameters into a window. Precedence: an explicit
    /// `date_to` wins over the default of yesterday; `days_back` wins over
    /// an explicit `date_from`; with nothing given the window is the single
    /// day of `date_to`.
    pub fn resolve(params: &WindowParams, today: NaiveDate) -> Result<Self, WindowError> {
        let to = match &params.date_to {
            Some(raw) => parse_date("date_to", raw)?,
            None => today - Duration::days(1),
        };
        let from = if let Some(days_back) = params.days_back {
            if !(1..=90).contains(&days_back) {
                return Err(WindowError::DaysBackOutOfRange(days_back));
            }
            to - Duration::days(days_back - 1)
        } else if let Some(raw) = &params.date_from {
            parse_date("date_from", raw)?
        } else {
            to
        };
        if from > to {
            return Err(WindowError::Inverted { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.from.and_time(NaiveTime::MIN).and_utc()
    }

    /// Exclusive upper bound: midnight after the last day of the window.
    pub fn end_exclusive(&self) -> DateTime<Utc> {
        (self.to + Duration::days(1)).and_time(NaiveTime::MIN).and_utc()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start() && ts < self.end_exclusive()
    }

    /// Stable advisory-lock key: identical windows always map to the
    /// identical key, so concurrent runs serialize per window while
    /// disjoint windows proceed in parallel.
    pub fn lock_key(&self) -> i64 {
        let digest = Sha256::digest(format!("{}:{}", self.from, self.to).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }

    pub fn label(&self) -> String {
        format!("{}..{}", self.from, self.to)
    }
}

fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, WindowError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| WindowError::BadDate {
        field,
        value: raw.to_string(),
    })
}

/// Per-run event-collection counters, returned alongside the aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectStats {
    pub total: u64,
    pub outbound: u64,
    pub ignored_type: u64,
    pub out_of_range: u64,
    pub missing_persona: u64,
    pub processed: u64,
    pub errors: Vec<String>,
}

/// Per-run merge counters. `missing` lists leads seen in campaign data but
/// absent from the lead store; `errors` are per-record update failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub updated: u64,
    pub skipped: u64,
    pub missing: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// Audit row persisted once per non-dry-run attempt; never mutated after
/// insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunLogEntry {
    pub window: SyncWindow,
    pub leads_found: u64,
    pub leads_updated: u64,
    pub leads_skipped: u64,
    pub missing_leads: u64,
    pub errors: Vec<String>,
    pub runtime_ms: u64,
    pub status: RunStatus,
}

/// Caller-facing outcome of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub window: SyncWindow,
    pub dry_run: bool,
    pub stats: CollectStats,
    pub leads_found: u64,
    pub merge: MergeOutcome,
    pub runtime_ms: u64,
    pub status: RunStatus,
}
