//! Startup reconciliation of a previously persisted sensor value.
//!
//! Both sensors go through [`reconcile_on_start`]; they only differ in the
//! [`RestoreKind`] they report and the maximum age they accept.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::RestoreParseError;
use crate::model::{ObservedValue, RestoredState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreKind {
    Accumulated,
    Historical,
}

impl RestoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreKind::Accumulated => "accumulated",
            RestoreKind::Historical => "historical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceReason {
    NoPreviousState,
    InvalidPreviousState,
    PreviousStateTooOld,
}

impl fmt::Display for ForceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ForceReason::NoPreviousState => "no previous state",
            ForceReason::InvalidPreviousState => "invalid previous state",
            ForceReason::PreviousStateTooOld => "previous state too old",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreDecision {
    UseRestored,
    ForceRefresh(ForceReason),
}

impl RestoreDecision {
    pub fn needs_refresh(&self) -> bool {
        matches!(self, RestoreDecision::ForceRefresh(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    pub decision: RestoreDecision,
    /// Value taken over from storage. Set whenever the stored value parsed, even if too old.
    pub adopted: Option<ObservedValue>,
}

pub fn parse_restored_value(raw: &str) -> Result<f64, RestoreParseError> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(RestoreParseError {
            raw: raw.to_string(),
        }),
    }
}

pub fn reconcile_on_start<Tz: TimeZone>(
    kind: RestoreKind,
    restored: Option<&RestoredState>,
    now: &DateTime<Tz>,
    max_age: Duration,
) -> Reconciliation {
    let Some(restored) = restored else {
        return force(kind, ForceReason::NoPreviousState, None);
    };

    let value = match parse_restored_value(&restored.value) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(kind = kind.as_str(), error = %err, "discarding restored state");
            return force(kind, ForceReason::InvalidPreviousState, None);
        }
    };

    let adopted = ObservedValue::new(value, restored.observed_at);
    tracing::debug!(
        kind = kind.as_str(),
        value,
        observed_at = %restored.observed_at,
        "restored previous state"
    );

    let age = now.with_timezone(&Utc) - restored.observed_at;
    if age > max_age {
        return force(kind, ForceReason::PreviousStateTooOld, Some(adopted));
    }

    Reconciliation {
        decision: RestoreDecision::UseRestored,
        adopted: Some(adopted),
    }
}

fn force(kind: RestoreKind, reason: ForceReason, adopted: Option<ObservedValue>) -> Reconciliation {
    tracing::debug!(kind = kind.as_str(), %reason, "forcing state refresh");
    Reconciliation {
        decision: RestoreDecision::ForceRefresh(reason),
        adopted,
    }
}
