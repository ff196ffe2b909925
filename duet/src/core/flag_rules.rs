//! Completion record ("flag") validation.
//!
//! Checks run in a fixed order and stop at the first failure:
//! parse, required fields, step match, freshness, status enum, next-agent enum.
//! The check is pure; disposal of a rejected record is up to the caller.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::core::step_id::StepId;
use crate::core::types::{CompletionRecord, NextAgent, Status};

pub const REQUIRED_FIELDS: [&str; 5] = ["agent", "step", "status", "nextAgent", "timestamp"];

/// Why a completion record was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagRejection {
    MalformedRecord(String),
    MissingField(&'static str),
    StepMismatch { expected: String, found: String },
    StaleRecord(String),
    UnknownStatus(String),
    UnknownAgent(String),
}

impl FlagRejection {
    /// Stable label for logs, the ledger, and the validation tool.
    pub fn kind(&self) -> &'static str {
        match self {
            FlagRejection::MalformedRecord(_) => "MalformedRecord",
            FlagRejection::MissingField(_) => "MissingField",
            FlagRejection::StepMismatch { .. } => "StepMismatch",
            FlagRejection::StaleRecord(_) => "StaleRecord",
            FlagRejection::UnknownStatus(_) => "UnknownStatus",
            FlagRejection::UnknownAgent(_) => "UnknownAgent",
        }
    }
}

impl fmt::Display for FlagRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagRejection::MalformedRecord(detail) => write!(f, "MalformedRecord: {detail}"),
            FlagRejection::MissingField(field) => {
                write!(f, "MissingField: '{field}' is missing or empty")
            }
            FlagRejection::StepMismatch { expected, found } => {
                write!(f, "StepMismatch: expected step '{expected}', found '{found}'")
            }
            FlagRejection::StaleRecord(detail) => write!(f, "StaleRecord: {detail}"),
            FlagRejection::UnknownStatus(status) => {
                write!(f, "UnknownStatus: '{status}' is not a known status")
            }
            FlagRejection::UnknownAgent(agent) => {
                write!(f, "UnknownAgent: '{agent}' is not a known next agent")
            }
        }
    }
}

impl std::error::Error for FlagRejection {}

/// Validate raw flag contents against the expected step at time `now`.
pub fn validate_flag(
    raw: &str,
    expected_step: &StepId,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<CompletionRecord, FlagRejection> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| FlagRejection::MalformedRecord(format!("invalid JSON: {err}")))?;
    let Value::Object(fields) = value else {
        return Err(FlagRejection::MalformedRecord(
            "expected a JSON object".to_string(),
        ));
    };

    for field in REQUIRED_FIELDS {
        required_str(&fields, field)?;
    }
    let agent = required_str(&fields, "agent")?;
    let step = required_str(&fields, "step")?;
    let status = required_str(&fields, "status")?;
    let next_agent = required_str(&fields, "nextAgent")?;
    let timestamp = required_str(&fields, "timestamp")?;

    if step != expected_step.as_str() {
        return Err(FlagRejection::StepMismatch {
            expected: expected_step.to_string(),
            found: step.to_string(),
        });
    }

    let stamped = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|err| FlagRejection::StaleRecord(format!("unparseable timestamp: {err}")))?
        .with_timezone(&Utc);
    let age = now.signed_duration_since(stamped);
    if age > max_age {
        return Err(FlagRejection::StaleRecord(format!(
            "record is {}s old (limit {}s)",
            age.num_seconds(),
            max_age.num_seconds()
        )));
    }

    let status =
        Status::parse(status).ok_or_else(|| FlagRejection::UnknownStatus(status.to_string()))?;
    let next_agent = NextAgent::parse(next_agent)
        .ok_or_else(|| FlagRejection::UnknownAgent(next_agent.to_string()))?;

    Ok(CompletionRecord {
        agent: agent.to_string(),
        step: expected_step.clone(),
        status,
        next_agent,
        timestamp: stamped,
    })
}

fn required_str<'a>(
    fields: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, FlagRejection> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(FlagRejection::MissingField(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(FlagRejection::MissingField(field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(FlagRejection::MalformedRecord(format!(
            "field '{field}' must be a string"
        ))),
    }
}
