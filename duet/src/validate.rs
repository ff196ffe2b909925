//! Validation entry points: `duet validate-flag` and `duet self-check`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;

use crate::core::flag_rules::{FlagRejection, validate_flag};
use crate::core::self_check::check_table_against_schema;
use crate::core::step_id::StepId;
use crate::core::types::CompletionRecord;
use crate::io::layout::{DuetPaths, FLAG_SCHEMA};

/// Run every flag check against the record at `path`.
///
/// The outer `Result` is for I/O failures; the inner one carries the first
/// failing check.
pub fn validate_flag_file(
    path: &Path,
    expected_step: &StepId,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<Result<CompletionRecord, FlagRejection>> {
    let bytes = fs::read(path).with_context(|| format!("read flag {}", path.display()))?;
    let raw = String::from_utf8_lossy(&bytes);
    let verdict = validate_flag(&raw, expected_step, now, max_age);
    debug!(path = %path.display(), ok = verdict.is_ok(), "flag validated");
    Ok(verdict)
}

/// Check the transition table against the embedded flag schema and, when
/// present, the copy handed to workers under `.duet/state/`.
pub fn self_check(paths: &DuetPaths) -> Result<()> {
    let mut problems = Vec::new();

    let embedded: Value = serde_json::from_str(FLAG_SCHEMA).context("parse embedded flag schema")?;
    problems.extend(check_table_against_schema(&embedded));

    if paths.flag_schema_path.exists() {
        let contents = fs::read_to_string(&paths.flag_schema_path)
            .with_context(|| format!("read {}", paths.flag_schema_path.display()))?;
        let on_disk: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", paths.flag_schema_path.display()))?;
        problems.extend(
            check_table_against_schema(&on_disk)
                .into_iter()
                .map(|problem| format!("{}: {problem}", paths.flag_schema_path.display())),
        );
    }

    if !problems.is_empty() {
        return Err(anyhow!(
            "transition table self-check failed:\n- {}",
            problems.join("\n- ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_now, flag_json, step};

    #[test]
    fn reports_first_failing_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("flag.json");
        fs::write(&path, flag_json("5", "approved", "implementer", fixed_now())).expect("write");

        let verdict = validate_flag_file(&path, &step("6"), fixed_now(), Duration::minutes(30))
            .expect("read");
        let rejection = verdict.expect_err("step mismatch");
        assert_eq!(rejection.kind(), "StepMismatch");

        let verdict = validate_flag_file(&path, &step("5"), fixed_now(), Duration::minutes(30))
            .expect("read");
        assert!(verdict.is_ok());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = validate_flag_file(
            &temp.path().join("nope.json"),
            &step("1"),
            fixed_now(),
            Duration::minutes(30),
        )
        .expect_err("missing");
        assert!(err.to_string().contains("read flag"));
    }

    #[test]
    fn self_check_flags_edited_worker_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = DuetPaths::new(temp.path());
        self_check(&paths).expect("embedded schema is consistent");

        fs::create_dir_all(&paths.state_dir).expect("mkdir");
        let edited = FLAG_SCHEMA.replace("\"verified-clean\"", "\"verified-clean\", \"abandoned\"");
        fs::write(&paths.flag_schema_path, edited).expect("write");
        let err = self_check(&paths).expect_err("gap");
        assert!(err.to_string().contains("abandoned"));
    }
}
