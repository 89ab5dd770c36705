//! Rehearsal scenarios: scripted frame sequences with expected replies.
//!
//! A [`ScenarioSet`] is loaded from JSON and replayed by a [`ScenarioRunner`]
//! against a running server, one client connection per scenario. Frames and
//! expected values may reference variables as `${name}`:
//! - `${run}` is the runner's run tag, so ids stay unique across reruns
//!   against one long-lived server.
//! - Any other name is bound by an earlier step's `capture`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::client::{Client, ClientError};
use crate::protocol::escape_bytes;

/// Names accepted by [`builtin`].
pub const BUILTIN_NAMES: [&str; 5] = [
    "use-after-free",
    "double-free",
    "read-after-free",
    "alloc-roundtrip",
    "heap-info",
];

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid scenario json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("unknown builtin scenario set {0:?} (known: {known})", known = BUILTIN_NAMES.join(", "))]
    UnknownBuiltin(String),
    #[error("{scenario} step {step}: invalid hex: {source}")]
    InvalidHex {
        scenario: String,
        step: usize,
        #[source]
        source: hex::FromHexError,
    },
    #[error("{scenario} step {step}: {reason}")]
    InvalidStep {
        scenario: String,
        step: usize,
        reason: String,
    },
}

/// A named collection of scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSet {
    /// Schema version.
    pub version: u32,
    pub name: String,
    pub scenarios: Vec<Scenario>,
}

impl ScenarioSet {
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Check every step is sendable before anything touches the network.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        for scenario in &self.scenarios {
            for (index, step) in scenario.steps.iter().enumerate() {
                step.check(&scenario.name, index)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
}

/// One frame and what the reply must look like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Text frame, with `${var}` substitution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<String>,
    /// Binary frame as hex. Not substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_hex: Option<String>,
    pub expect: Expectation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<Capture>,
}

impl Step {
    fn check(&self, scenario: &str, index: usize) -> Result<(), ScenarioError> {
        let invalid = |reason: &str| ScenarioError::InvalidStep {
            scenario: scenario.to_string(),
            step: index,
            reason: reason.to_string(),
        };
        match (&self.send, &self.send_hex) {
            (Some(_), Some(_)) => return Err(invalid("both send and send_hex are set")),
            (None, None) => return Err(invalid("one of send or send_hex is required")),
            (None, Some(h)) => decode_hex(h, scenario, index).map(drop)?,
            (Some(_), None) => {}
        }
        match &self.expect {
            Expectation::ExactHex { hex } | Expectation::PrefixHex { hex } => {
                decode_hex(hex, scenario, index).map(drop)
            }
            _ => Ok(()),
        }
    }

    fn frame(&self, vars: &Vars, scenario: &str, index: usize) -> Result<Vec<u8>, ScenarioError> {
        match (&self.send, &self.send_hex) {
            (Some(text), None) => Ok(vars.substitute(text).into_bytes()),
            (None, Some(h)) => decode_hex(h, scenario, index),
            _ => Err(ScenarioError::InvalidStep {
                scenario: scenario.to_string(),
                step: index,
                reason: "exactly one of send or send_hex is required".to_string(),
            }),
        }
    }
}

/// Expected reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    Exact { value: String },
    Prefix { value: String },
    ExactHex { hex: String },
    PrefixHex { hex: String },
    Any,
}

impl Expectation {
    /// Returns the expected bytes (after substitution) and whether the reply
    /// matched.
    fn evaluate(
        &self,
        reply: &[u8],
        vars: &Vars,
        scenario: &str,
        index: usize,
    ) -> Result<(String, bool), ScenarioError> {
        let outcome = match self {
            Self::Exact { value } => {
                let want = vars.substitute(value);
                let ok = reply == want.as_bytes();
                (format!("exact {}", escape_bytes(want.as_bytes())), ok)
            }
            Self::Prefix { value } => {
                let want = vars.substitute(value);
                let ok = reply.starts_with(want.as_bytes());
                (format!("prefix {}", escape_bytes(want.as_bytes())), ok)
            }
            Self::ExactHex { hex } => {
                let want = decode_hex(hex, scenario, index)?;
                (format!("exact {}", escape_bytes(&want)), reply == want)
            }
            Self::PrefixHex { hex } => {
                let want = decode_hex(hex, scenario, index)?;
                (format!("prefix {}", escape_bytes(&want)), reply.starts_with(&want))
            }
            Self::Any => ("any".to_string(), true),
        };
        Ok(outcome)
    }
}

/// Bind part of a reply to a variable for later steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub var: String,
    /// Stripped from the front of the reply when present.
    #[serde(default)]
    pub after_prefix: String,
}

#[derive(Debug, Default)]
struct Vars(HashMap<String, String>);

impl Vars {
    fn substitute(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.0.get(name) {
                        Some(value) => out.push_str(value),
                        // Unbound names stay literal so the mismatch is visible.
                        None => out.push_str(&rest[start..start + 3 + end]),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn decode_hex(text: &str, scenario: &str, step: usize) -> Result<Vec<u8>, ScenarioError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    hex::decode(compact).map_err(|source| ScenarioError::InvalidHex {
        scenario: scenario.to_string(),
        step,
        source,
    })
}

/// Load one of the sets shipped with the binary.
pub fn builtin(name: &str) -> Result<ScenarioSet, ScenarioError> {
    let json = match name {
        "use-after-free" => include_str!("../scenarios/use-after-free.json"),
        "double-free" => include_str!("../scenarios/double-free.json"),
        "read-after-free" => include_str!("../scenarios/read-after-free.json"),
        "alloc-roundtrip" => include_str!("../scenarios/alloc-roundtrip.json"),
        "heap-info" => include_str!("../scenarios/heap-info.json"),
        other => return Err(ScenarioError::UnknownBuiltin(other.to_string())),
    };
    ScenarioSet::from_json(json)
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    /// Frame as sent, non-printable bytes escaped.
    pub sent: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub set: String,
    pub name: String,
    pub passed: bool,
    pub steps: Vec<StepReport>,
    /// SHA-256 over every frame and reply, length-prefixed. Two runs with the
    /// same run tag against fresh servers produce the same digest.
    pub transcript_sha256: String,
    /// Transport failure that cut the scenario short.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RehearsalReport {
    pub run_tag: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub scenarios: Vec<ScenarioReport>,
}

impl RehearsalReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    fn push(&mut self, report: ScenarioReport) {
        self.total += 1;
        if report.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.scenarios.push(report);
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Replays scenario sets against one server address.
pub struct ScenarioRunner {
    pub addr: SocketAddr,
    /// Value of `${run}`.
    pub run_tag: String,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(addr: SocketAddr, run_tag: impl Into<String>) -> Self {
        Self {
            addr,
            run_tag: run_tag.into(),
        }
    }

    /// Run every scenario of every set, in order.
    pub fn run_all(&self, sets: &[ScenarioSet]) -> Result<RehearsalReport, ScenarioError> {
        let mut report = RehearsalReport {
            run_tag: self.run_tag.clone(),
            ..RehearsalReport::default()
        };
        for set in sets {
            set.validate()?;
            for scenario in &set.scenarios {
                report.push(self.run_scenario(&set.name, scenario)?);
            }
        }
        Ok(report)
    }

    /// Run one scenario on a fresh connection. Connecting is the only
    /// transport failure returned as an error; anything later is recorded in
    /// the report and fails the scenario.
    pub fn run_scenario(
        &self,
        set: &str,
        scenario: &Scenario,
    ) -> Result<ScenarioReport, ScenarioError> {
        let mut client = Client::connect(self.addr)?;
        let mut vars = Vars::default();
        vars.0.insert("run".to_string(), self.run_tag.clone());

        let mut transcript = Sha256::new();
        let mut steps = Vec::with_capacity(scenario.steps.len());
        let mut error = None;

        for (index, step) in scenario.steps.iter().enumerate() {
            let frame = step.frame(&vars, &scenario.name, index)?;
            let reply = match client.request(&frame) {
                Ok(reply) => reply,
                Err(err) => {
                    error = Some(format!("step {index}: {err}"));
                    break;
                }
            };
            for part in [&frame, &reply] {
                transcript.update((part.len() as u64).to_le_bytes());
                transcript.update(part);
            }

            let (expected, passed) = step.expect.evaluate(&reply, &vars, &scenario.name, index)?;
            if passed {
                if let Some(capture) = &step.capture {
                    let tail = reply
                        .strip_prefix(capture.after_prefix.as_bytes())
                        .unwrap_or(&reply[..]);
                    vars.0.insert(
                        capture.var.clone(),
                        String::from_utf8_lossy(tail).into_owned(),
                    );
                }
            }
            steps.push(StepReport {
                index,
                sent: escape_bytes(&frame),
                expected,
                actual: escape_bytes(&reply),
                passed,
            });
        }

        let passed = error.is_none()
            && steps.len() == scenario.steps.len()
            && steps.iter().all(|s| s.passed);
        Ok(ScenarioReport {
            set: set.to_string(),
            name: scenario.name.clone(),
            passed,
            steps,
            transcript_sha256: hex::encode(transcript.finalize()),
            error,
        })
    }
}

/// Short tag for `${run}`, distinct per process invocation.
#[must_use]
pub fn fresh_run_tag() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let digest = Sha256::digest(format!("{}-{nanos}", std::process::id()));
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        Vars(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[test]
    fn builtins_parse_and_validate() {
        for name in BUILTIN_NAMES {
            let set = builtin(name).unwrap();
            assert_eq!(set.name, name);
            assert!(!set.scenarios.is_empty(), "{name}");
            set.validate().unwrap();
        }
        assert!(matches!(
            builtin("heap-spray"),
            Err(ScenarioError::UnknownBuiltin(_))
        ));
    }

    #[test]
    fn printed_builtins_load_back() {
        for name in BUILTIN_NAMES {
            let set = builtin(name).unwrap();
            let reloaded = ScenarioSet::from_json(&set.to_json().unwrap()).unwrap();
            assert_eq!(reloaded.name, set.name);
            assert_eq!(reloaded.scenarios.len(), set.scenarios.len());
            reloaded.validate().unwrap();
        }
    }

    #[test]
    fn substitution_replaces_known_and_keeps_unknown() {
        let v = vars(&[("run", "ab12"), ("chunk", "chunk_3")]);
        assert_eq!(v.substitute("CREATE:uaf-${run}"), "CREATE:uaf-ab12");
        assert_eq!(v.substitute("READ:${chunk}"), "READ:chunk_3");
        assert_eq!(v.substitute("X:${missing}"), "X:${missing}");
        assert_eq!(v.substitute("X:${open"), "X:${open");
        assert_eq!(v.substitute("${run}${run}"), "ab12ab12");
    }

    #[test]
    fn expectations_match_bytes() {
        let v = vars(&[("run", "r")]);
        let exact = Expectation::Exact {
            value: "CREATED:a-${run}".into(),
        };
        assert!(exact.evaluate(b"CREATED:a-r", &v, "s", 0).unwrap().1);
        assert!(!exact.evaluate(b"CREATED:a-rx", &v, "s", 0).unwrap().1);

        let hex_prefix = Expectation::PrefixHex {
            hex: "5541465f 44455445435445443a".into(),
        };
        assert!(hex_prefix.evaluate(b"UAF_DETECTED:\xef", &v, "s", 0).unwrap().1);
        assert!(Expectation::Any.evaluate(b"", &v, "s", 0).unwrap().1);
    }

    #[test]
    fn invalid_steps_are_rejected_up_front() {
        let json = r#"{"version":1,"name":"bad","scenarios":[{"name":"s","steps":[
            {"send_hex":"zz","expect":{"kind":"any"}}]}]}"#;
        let set = ScenarioSet::from_json(json).unwrap();
        assert!(matches!(
            set.validate(),
            Err(ScenarioError::InvalidHex { step: 0, .. })
        ));

        let json = r#"{"version":1,"name":"bad","scenarios":[{"name":"s","steps":[
            {"expect":{"kind":"exact","value":"x"}}]}]}"#;
        let set = ScenarioSet::from_json(json).unwrap();
        assert!(matches!(
            set.validate(),
            Err(ScenarioError::InvalidStep { .. })
        ));
    }

    #[test]
    fn unknown_expectation_kind_is_json_error() {
        let json = r#"{"version":1,"name":"bad","scenarios":[{"name":"s","steps":[
            {"send":"HEAPINFO","expect":{"kind":"regex","value":"."}}]}]}"#;
        assert!(matches!(
            ScenarioSet::from_json(json),
            Err(ScenarioError::Json(_))
        ));
    }

    #[test]
    fn run_tags_fit_inside_an_id() {
        let tag = fresh_run_tag();
        assert_eq!(tag.len(), 8);
        assert!(tag.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
