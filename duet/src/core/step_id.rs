//! Step identifiers and the successor rule applied on `advance`.

use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

static STEP_ID_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(\d+)(?:\.(\d+))?([a-z])?$").expect("step id regex is valid")
});

/// Validated step identifier (`^\d+(\.\d+)?[a-z]?$`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StepId {
    raw: String,
    major: u64,
    minor: Option<u64>,
    letter: Option<char>,
}

/// Next step id computed when a step reaches `advance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Successor {
    /// Plain integer id; the successor is unambiguous.
    Certain(StepId),
    /// Composite id; a heuristic produced `next` and a human must confirm it.
    Ambiguous { next: StepId, reason: String },
}

impl Successor {
    pub fn step(&self) -> &StepId {
        match self {
            Successor::Certain(next) | Successor::Ambiguous { next, .. } => next,
        }
    }
}

impl StepId {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let caps = STEP_ID_RE
            .captures(raw)
            .ok_or_else(|| format!("invalid step id '{raw}' (expected ^\\d+(\\.\\d+)?[a-z]?$)"))?;
        let major = caps[1]
            .parse::<u64>()
            .map_err(|_| format!("step id '{raw}' major number out of range"))?;
        let minor = match caps.get(2) {
            Some(m) => Some(
                m.as_str()
                    .parse::<u64>()
                    .map_err(|_| format!("step id '{raw}' minor number out of range"))?,
            ),
            None => None,
        };
        let letter = caps.get(3).and_then(|m| m.as_str().chars().next());
        Ok(Self {
            raw: raw.to_string(),
            major,
            minor,
            letter,
        })
    }

    fn from_parts(major: u64, minor: Option<u64>, letter: Option<char>) -> Self {
        let mut raw = major.to_string();
        if let Some(minor) = minor {
            raw.push_str(&format!(".{minor}"));
        }
        if let Some(letter) = letter {
            raw.push(letter);
        }
        Self {
            raw,
            major,
            minor,
            letter,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Compute the id of the step that follows this one.
    ///
    /// - `7` -> `8` (certain)
    /// - `11b` -> `11c`, `7.2` -> `7.3`, `7.2a` -> `7.2b` (ambiguous)
    /// - `11z` -> `12` (ambiguous; the letter range is exhausted)
    pub fn successor(&self) -> Successor {
        let next_major = self.major.saturating_add(1);
        match (self.minor, self.letter) {
            (None, None) => Successor::Certain(Self::from_parts(next_major, None, None)),
            (minor, Some(letter)) if letter < 'z' => Successor::Ambiguous {
                next: Self::from_parts(self.major, minor, char::from_u32(u32::from(letter) + 1)),
                reason: format!("composite step id '{}': bumped suffix letter", self.raw),
            },
            (_, Some(_)) => Successor::Ambiguous {
                next: Self::from_parts(next_major, None, None),
                reason: format!(
                    "composite step id '{}': suffix letters exhausted, moved to next integer",
                    self.raw
                ),
            },
            (Some(minor), None) => Successor::Ambiguous {
                next: Self::from_parts(self.major, Some(minor.saturating_add(1)), None),
                reason: format!("composite step id '{}': bumped minor number", self.raw),
            },
        }
    }
}

impl TryFrom<String> for StepId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StepId> for String {
    fn from(value: StepId) -> Self {
        value.raw
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(raw: &str) -> StepId {
        StepId::parse(raw).expect("valid step id")
    }

    #[test]
    fn accepts_documented_grammar() {
        for raw in ["1", "42", "7.2", "11b", "3.10a"] {
            assert!(StepId::parse(raw).is_ok(), "{raw} should parse");
        }
        for raw in ["", "a", "1.", "1.2.3", "11B", "11bc", "-1", " 1"] {
            assert!(StepId::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn plain_integer_successor_is_certain() {
        assert_eq!(step("7").successor(), Successor::Certain(step("8")));
        assert_eq!(step("99").successor(), Successor::Certain(step("100")));
    }

    #[test]
    fn long_numeric_ids_parse_and_advance() {
        assert_eq!(
            step("99999999999").successor(),
            Successor::Certain(step("100000000000"))
        );
        assert_eq!(
            step("4294967296.4294967296").successor().step(),
            &step("4294967296.4294967297")
        );
        assert!(StepId::parse("99999999999999999999").is_err());
    }

    #[test]
    fn composite_successors_are_flagged() {
        let next = step("11b").successor();
        assert!(matches!(next, Successor::Ambiguous { .. }));
        assert_eq!(next.step(), &step("11c"));

        assert_eq!(step("7.2").successor().step(), &step("7.3"));
        assert_eq!(step("7.2a").successor().step(), &step("7.2b"));
        assert_eq!(step("11z").successor().step(), &step("12"));
        assert!(matches!(
            step("11z").successor(),
            Successor::Ambiguous { .. }
        ));
    }

    #[test]
    fn deserialization_rejects_bad_ids() {
        let ok: StepId = serde_json::from_str("\"5\"").expect("parse");
        assert_eq!(ok.as_str(), "5");
        assert!(serde_json::from_str::<StepId>("\"five\"").is_err());
    }
}
