//! Startup check that the flag schema and the transition table agree.
//!
//! The table itself is an exhaustive match, so the compiler guarantees every
//! `(phase, status)` combination is classified. What it cannot see is the
//! JSON schema handed to workers: a status added there without a matching
//! enum variant and table entry would silently route nowhere.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::core::transitions::transition;
use crate::core::types::{NextAgent, Status};

/// Verify that `flag_schema` and the table are consistent.
///
/// Returns a list of stable error messages (empty on success).
pub fn check_table_against_schema(flag_schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let schema_statuses = enum_values(flag_schema, "status");
    let known: BTreeSet<String> = Status::ALL.iter().map(|s| s.as_str().to_string()).collect();
    match schema_statuses {
        Some(values) => {
            for value in values.difference(&known) {
                errors.push(format!(
                    "flag schema status '{value}' has no enum variant or table entry"
                ));
            }
            for value in known.difference(&values) {
                errors.push(format!("status '{value}' is missing from the flag schema"));
            }
        }
        None => errors.push("flag schema has no status enum".to_string()),
    }

    let known_agents: BTreeSet<String> = NextAgent::ALL
        .iter()
        .map(|a| a.as_str().to_string())
        .collect();
    match enum_values(flag_schema, "nextAgent") {
        Some(values) if values == known_agents => {}
        Some(values) => errors.push(format!(
            "flag schema nextAgent enum {values:?} differs from {known_agents:?}"
        )),
        None => errors.push("flag schema has no nextAgent enum".to_string()),
    }

    for status in Status::ALL {
        for phase in status.legal_phases() {
            if transition(*phase, status).is_none() {
                errors.push(format!(
                    "status '{status}' is legal in phase '{phase}' but has no table entry"
                ));
            }
        }
    }

    errors
}

fn enum_values(schema: &Value, property: &str) -> Option<BTreeSet<String>> {
    let values = schema
        .get("properties")?
        .get(property)?
        .get("enum")?
        .as_array()?;
    Some(
        values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::layout::FLAG_SCHEMA;

    #[test]
    fn shipped_schema_matches_table() {
        let schema: Value = serde_json::from_str(FLAG_SCHEMA).expect("parse schema");
        assert_eq!(check_table_against_schema(&schema), Vec::<String>::new());
    }

    #[test]
    fn reports_status_without_table_entry() {
        let mut schema: Value = serde_json::from_str(FLAG_SCHEMA).expect("parse schema");
        schema["properties"]["status"]["enum"]
            .as_array_mut()
            .expect("enum array")
            .push(Value::String("rejected".to_string()));
        let errors = check_table_against_schema(&schema);
        assert_eq!(
            errors,
            vec!["flag schema status 'rejected' has no enum variant or table entry".to_string()]
        );
    }

    #[test]
    fn reports_missing_enum() {
        let schema = serde_json::json!({"properties": {}});
        let errors = check_table_against_schema(&schema);
        assert!(errors.iter().any(|e| e.contains("no status enum")));
        assert!(errors.iter().any(|e| e.contains("no nextAgent enum")));
    }
}
