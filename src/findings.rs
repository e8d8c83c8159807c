//! Turns raw service payloads into structured findings.
//!
//! A payload is first read as JSON (the span between the first `{` and the last `}`).
//! When that fails the text is scanned for keyword clusters instead, so a chatty
//! answer still yields something coarse rather than nothing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

const DEFAULT_CONFIDENCE: f64 = 0.5;
const DEFAULT_LOCATION: &str = "unknown location";
const HEURISTIC_HINT: f64 = 0.3;

const MISSING_WORDS: &[&str] = &["missing", "absent", "缺失", "没有", "缺少"];
const ALARM_WORDS: &[&str] = &["alarm", "warning", "报警", "警报"];
const SAFETY_WORDS: &[&str] = &["safety", "hazard", "安全", "危险"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum FindingKind {
    MissingItem,
    ExistingItem,
    SafetyIssue,
    LogicError,
    Unknown,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::MissingItem => "missing_item",
            FindingKind::ExistingItem => "existing_item",
            FindingKind::SafetyIssue => "safety_issue",
            FindingKind::LogicError => "logic_error",
            FindingKind::Unknown => "unknown",
        }
    }

    /// Plural phrase used in report summaries.
    pub fn describe(&self) -> &'static str {
        match self {
            FindingKind::MissingItem => "missing items",
            FindingKind::ExistingItem => "existing items",
            FindingKind::SafetyIssue => "safety issues",
            FindingKind::LogicError => "logic errors",
            FindingKind::Unknown => "unclassified findings",
        }
    }

    /// Accepts the canonical labels plus the alarm-specific aliases services tend to emit.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "missing_item" | "missing_alarm" => FindingKind::MissingItem,
            "existing_item" | "existing_alarm" => FindingKind::ExistingItem,
            "safety_issue" => FindingKind::SafetyIssue,
            "logic_error" => FindingKind::LogicError,
            _ => FindingKind::Unknown,
        }
    }
}

impl From<String> for FindingKind {
    fn from(label: String) -> Self {
        Self::from_label(&label)
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Severity {
    /// critical=4 .. low=1; anything unrecognized ranks below low.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
            Severity::Unknown => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Unknown,
        }
    }

    pub fn is_urgent(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl From<String> for Severity {
    fn from(label: String) -> Self {
        Self::from_label(&label)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reported issue or observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub location: String,
    pub description: String,
    pub recommendation: String,
    pub confidence: f64,
    pub source_shard_ids: BTreeSet<String>,
    pub occurrence_count: usize,
}

/// How a payload was understood.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPayload {
    Structured(Vec<Finding>),
    Heuristic(Vec<Finding>),
    Unparseable,
}

impl ParsedPayload {
    pub fn into_findings(self) -> Vec<Finding> {
        match self {
            ParsedPayload::Structured(findings) | ParsedPayload::Heuristic(findings) => findings,
            ParsedPayload::Unparseable => Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    #[serde(default)]
    findings: Vec<RawFinding>,
    #[serde(default)]
    confidence_score: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFinding {
    #[serde(default, rename = "type")]
    type_label: Option<Value>,
    #[serde(default)]
    kind: Option<Value>,
    #[serde(default)]
    severity: Option<Value>,
    #[serde(default)]
    location: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default)]
    recommendation: Option<Value>,
    #[serde(default)]
    confidence: Option<Value>,
}

impl RawFinding {
    fn into_finding(self, shard_id: &str) -> Finding {
        Finding {
            kind: text(self.type_label)
                .or_else(|| text(self.kind))
                .map(|k| FindingKind::from_label(&k))
                .unwrap_or(FindingKind::Unknown),
            severity: text(self.severity).map(|s| Severity::from_label(&s)).unwrap_or(Severity::Low),
            location: text(self.location).unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            description: text(self.description).unwrap_or_default(),
            recommendation: text(self.recommendation).unwrap_or_default(),
            confidence: number(self.confidence).unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
            source_shard_ids: BTreeSet::from([shard_id.to_string()]),
            occurrence_count: 1,
        }
    }
}

fn text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn number(value: Option<Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

/// Span from the first `{` to the last `}`, if any.
fn json_slice(payload: &str) -> Option<&str> {
    let start = payload.find('{')?;
    let end = payload.rfind('}')?;
    (end > start).then(|| &payload[start..=end])
}

fn parse_structured(payload: &str) -> Result<RawPayload, String> {
    let slice = json_slice(payload).ok_or_else(|| "no JSON object in payload".to_string())?;
    serde_json::from_str(slice).map_err(|e| e.to_string())
}

/// Reads the findings of one successful outcome.
pub fn parse_payload(shard_id: &str, payload: &str) -> ParsedPayload {
    match parse_structured(payload) {
        Ok(raw) => ParsedPayload::Structured(
            raw.findings.into_iter().map(|f| f.into_finding(shard_id)).collect(),
        ),
        Err(reason) => {
            warn!("Could not parse JSON result of shard {} ({}), falling back to text scan", shard_id, reason);
            let findings = heuristic_findings(shard_id, payload);
            if findings.is_empty() {
                debug!("No recognizable findings in shard {}", shard_id);
                ParsedPayload::Unparseable
            } else {
                ParsedPayload::Heuristic(findings)
            }
        }
    }
}

/// Self-reported confidence of a payload; coarse when the payload is not JSON.
pub fn confidence_hint(payload: &str) -> f64 {
    match parse_structured(payload) {
        Ok(raw) => number(raw.confidence_score).unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
        Err(_) => HEURISTIC_HINT,
    }
}

fn heuristic_findings(shard_id: &str, payload: &str) -> Vec<Finding> {
    let content = payload.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|w| content.contains(w));
    let mut findings = Vec::new();

    if mentions(MISSING_WORDS) && mentions(ALARM_WORDS) {
        findings.push(heuristic_finding(
            shard_id,
            FindingKind::MissingItem,
            Severity::Medium,
            "Possible missing alarm detected",
            "Analyze the specific alarm requirements further",
            0.6,
        ));
    }

    if mentions(SAFETY_WORDS) {
        findings.push(heuristic_finding(
            shard_id,
            FindingKind::SafetyIssue,
            Severity::High,
            "Possible safety-related issue detected",
            "Perform a detailed safety analysis",
            0.5,
        ));
    }

    findings
}

fn heuristic_finding(
    shard_id: &str,
    kind: FindingKind,
    severity: Severity,
    description: &str,
    recommendation: &str,
    confidence: f64,
) -> Finding {
    Finding {
        kind,
        severity,
        location: format!("shard {}", shard_id),
        description: description.to_string(),
        recommendation: recommendation.to_string(),
        confidence,
        source_shard_ids: BTreeSet::from([shard_id.to_string()]),
        occurrence_count: 1,
    }
}
