//! Fuses per-shard outcomes into one ranked report.

use crate::config::{ConfidenceWeights, FusionConfig};
use crate::dispatch::AnalysisOutcome;
use crate::error::FailureKind;
use crate::findings::{self, Finding, FindingKind, Severity};
use crate::llm::AnalysisKind;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::info;

const CONSISTENCY_SATURATION: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedReport {
    pub analysis_kind: AnalysisKind,
    pub findings: Vec<Finding>,
    pub summary: String,
    pub overall_confidence: f64,
    /// Absent when no shard could be analyzed.
    pub statistics: Option<Statistics>,
    pub dispatch_summary: DispatchSummary,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_shards: usize,
    pub successful_shards: usize,
    pub success_rate: f64,
    pub total_findings: usize,
    pub finding_kinds: BTreeMap<FindingKind, usize>,
    pub severity_counts: BTreeMap<Severity, usize>,
    pub average_confidence: f64,
    pub total_elapsed_secs: f64,
    pub average_elapsed_secs: f64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub total_shards: usize,
    pub successful_shards: usize,
    pub failed_shards: usize,
    pub failed_shard_ids: Vec<String>,
    pub error_summary: BTreeMap<FailureKind, usize>,
    pub cache_hits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchSummary {
    pub fn from_outcomes(outcomes: &[AnalysisOutcome]) -> Self {
        let mut summary = DispatchSummary {
            total_shards: outcomes.len(),
            ..Default::default()
        };

        for outcome in outcomes {
            if outcome.cached {
                summary.cache_hits += 1;
            }
            if outcome.success {
                summary.successful_shards += 1;
            } else {
                summary.failed_shards += 1;
                summary.failed_shard_ids.push(outcome.shard_id.clone());
                let kind = outcome.failure_kind.unwrap_or(FailureKind::Other);
                *summary.error_summary.entry(kind).or_insert(0) += 1;
            }
        }
        summary.failed_shard_ids.sort();
        summary
    }
}

pub struct FusionEngine {
    similarity_threshold: f64,
    weights: ConfidenceWeights,
    occurrence_note: Regex,
}

impl FusionEngine {
    pub fn new(config: &FusionConfig) -> Result<Self> {
        Ok(Self {
            similarity_threshold: config.similarity_threshold,
            weights: config.weights,
            occurrence_note: Regex::new(r" \(found in \d+ locations\)$")?,
        })
    }

    pub fn fuse(&self, outcomes: &[AnalysisOutcome], kind: AnalysisKind) -> FusedReport {
        let dispatch_summary = DispatchSummary::from_outcomes(outcomes);
        info!(
            "Fusing {} outcomes ({} successful)",
            outcomes.len(),
            dispatch_summary.successful_shards
        );

        // Completion order varies between runs; shard order does not.
        let mut successful: Vec<&AnalysisOutcome> = outcomes.iter().filter(|o| o.success).collect();
        if successful.is_empty() {
            let reason = if outcomes.is_empty() {
                "no shards were analyzed".to_string()
            } else {
                match most_common_failure(outcomes) {
                    Some((cause, count)) => format!(
                        "all {} shard analyses failed (most common cause: {}, {} of {})",
                        outcomes.len(),
                        cause,
                        count,
                        outcomes.len()
                    ),
                    None => format!("all {} shard analyses failed", outcomes.len()),
                }
            };
            return self.empty_report(kind, &reason, dispatch_summary);
        }
        successful.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));

        let raw: Vec<Finding> = successful
            .iter()
            .flat_map(|o| findings::parse_payload(&o.shard_id, &o.raw_payload).into_findings())
            .collect();
        info!("Extracted {} raw findings", raw.len());

        let merged = self.rank(self.deduplicate(raw));
        info!("{} findings after deduplication", merged.len());

        let statistics = self.statistics(outcomes, &merged);
        let summary = self.summarize(&merged);
        let overall_confidence = self.overall_confidence(statistics.success_rate, &merged);

        FusedReport {
            analysis_kind: kind,
            findings: merged,
            summary,
            overall_confidence,
            statistics: Some(statistics),
            dispatch_summary,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn empty_report(&self, kind: AnalysisKind, reason: &str, mut dispatch_summary: DispatchSummary) -> FusedReport {
        dispatch_summary.error = Some(reason.to_string());
        FusedReport {
            analysis_kind: kind,
            findings: Vec::new(),
            summary: format!("Analysis could not be completed: {}", reason),
            overall_confidence: 0.0,
            statistics: None,
            dispatch_summary,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Merges near-duplicate findings within each (kind, severity) group.
    pub fn deduplicate(&self, findings: Vec<Finding>) -> Vec<Finding> {
        let mut order: Vec<(FindingKind, Severity)> = Vec::new();
        let mut groups: HashMap<(FindingKind, Severity), Vec<Finding>> = HashMap::new();
        for finding in findings {
            let key = (finding.kind, finding.severity);
            if !groups.contains_key(&key) {
                order.push(key);
            }
            groups.entry(key).or_default().push(finding);
        }

        order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .flat_map(|group| self.cluster(group))
            .collect()
    }

    fn cluster(&self, group: Vec<Finding>) -> Vec<Finding> {
        let mut assigned = vec![false; group.len()];
        let mut merged = Vec::new();

        for i in 0..group.len() {
            if assigned[i] {
                continue;
            }
            assigned[i] = true;
            let mut members = vec![&group[i]];
            for j in (i + 1)..group.len() {
                if !assigned[j] && self.similarity(&group[i], &group[j]) > self.similarity_threshold {
                    assigned[j] = true;
                    members.push(&group[j]);
                }
            }
            merged.push(self.merge(&members));
        }

        merged
    }

    /// Kind and severity agreement plus token overlap of the descriptions.
    pub fn similarity(&self, a: &Finding, b: &Finding) -> f64 {
        let mut score = 0.0;
        if a.kind == b.kind {
            score += 0.4;
        }
        if a.severity == b.severity {
            score += 0.2;
        }
        score + 0.4 * token_overlap(self.base_description(a), self.base_description(b))
    }

    fn base_description<'a>(&self, finding: &'a Finding) -> &'a str {
        match self.occurrence_note.find(&finding.description) {
            Some(m) => &finding.description[..m.start()],
            None => &finding.description,
        }
    }

    fn merge(&self, members: &[&Finding]) -> Finding {
        let base = members[0];
        if members.len() == 1 {
            return base.clone();
        }

        let count = members.len();
        let source_shard_ids: BTreeSet<String> = members
            .iter()
            .flat_map(|f| f.source_shard_ids.iter().cloned())
            .collect();

        Finding {
            kind: base.kind,
            severity: base.severity,
            location: base.location.clone(),
            description: format!("{} (found in {} locations)", self.base_description(base), count),
            recommendation: base.recommendation.clone(),
            confidence: members.iter().map(|f| f.confidence).sum::<f64>() / count as f64,
            source_shard_ids,
            occurrence_count: count,
        }
    }

    /// Severity, then confidence, then occurrence count; ties keep their order.
    pub fn rank(&self, mut findings: Vec<Finding>) -> Vec<Finding> {
        findings.sort_by(|a, b| {
            b.severity
                .rank()
                .cmp(&a.severity.rank())
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| b.occurrence_count.cmp(&a.occurrence_count))
        });
        findings
    }

    pub fn statistics(&self, outcomes: &[AnalysisOutcome], findings: &[Finding]) -> Statistics {
        let successful: Vec<&AnalysisOutcome> = outcomes.iter().filter(|o| o.success).collect();
        let mut finding_kinds = BTreeMap::new();
        let mut severity_counts = BTreeMap::new();
        for finding in findings {
            *finding_kinds.entry(finding.kind).or_insert(0) += 1;
            *severity_counts.entry(finding.severity).or_insert(0) += 1;
        }

        let total_elapsed_secs: f64 = successful.iter().map(|o| o.elapsed_secs).sum();

        Statistics {
            total_shards: outcomes.len(),
            successful_shards: successful.len(),
            success_rate: ratio(successful.len(), outcomes.len()),
            total_findings: findings.len(),
            finding_kinds,
            severity_counts,
            average_confidence: mean(findings.iter().map(|f| f.confidence)),
            total_elapsed_secs,
            average_elapsed_secs: mean(successful.iter().map(|o| o.elapsed_secs)),
            total_tokens: outcomes
                .iter()
                .filter_map(|o| o.token_usage.as_ref())
                .map(|u| u.total_tokens)
                .sum(),
        }
    }

    /// Weighted mean of the available factors, clamped to [0, 1].
    pub fn overall_confidence(&self, success_rate: f64, findings: &[Finding]) -> f64 {
        let mut factors = vec![(success_rate, self.weights.success_rate)];
        if !findings.is_empty() {
            factors.push((mean(findings.iter().map(|f| f.confidence)), self.weights.finding_confidence));
            let consistency = (mean(findings.iter().map(|f| f.occurrence_count as f64)) / CONSISTENCY_SATURATION).min(1.0);
            factors.push((consistency, self.weights.consistency));
        }

        let total_weight: f64 = factors.iter().map(|(_, w)| w).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        let score = factors.iter().map(|(f, w)| f * w).sum::<f64>() / total_weight;
        score.clamp(0.0, 1.0)
    }

    pub fn summarize(&self, findings: &[Finding]) -> String {
        if findings.is_empty() {
            return "No significant issues were found in this analysis.".to_string();
        }

        let critical = findings.iter().filter(|f| f.severity == Severity::Critical).count();
        let high = findings.iter().filter(|f| f.severity == Severity::High).count();

        let mut parts = vec![format!("Analysis found {} issues", findings.len())];
        if critical > 0 {
            parts.push(format!("{} critical", critical));
        }
        if high > 0 {
            parts.push(format!("{} high priority", high));
        }

        if let Some((kind, count)) = most_frequent_kind(findings) {
            if count > 1 {
                parts.push(format!("Most frequent type: {} ({})", kind.describe(), count));
            }
        }

        if critical + high > 0 {
            parts.push("Address the critical and high-priority issues first".to_string());
        }

        format!("{}.", parts.join(". "))
    }
}

/// Ties go to the kind seen first.
fn most_frequent_kind(findings: &[Finding]) -> Option<(FindingKind, usize)> {
    let mut counts: Vec<(FindingKind, usize)> = Vec::new();
    for finding in findings {
        match counts.iter_mut().find(|(kind, _)| *kind == finding.kind) {
            Some((_, count)) => *count += 1,
            None => counts.push((finding.kind, 1)),
        }
    }
    counts.into_iter().fold(None, |best, current| match best {
        Some(b) if b.1 >= current.1 => Some(b),
        _ => Some(current),
    })
}

/// Failure reason shared by the most outcomes; the earliest wins a tie.
fn most_common_failure(outcomes: &[AnalysisOutcome]) -> Option<(&str, usize)> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for reason in outcomes.iter().filter_map(|o| o.failure_reason.as_deref()) {
        match counts.iter_mut().find(|(seen, _)| *seen == reason) {
            Some((_, count)) => *count += 1,
            None => counts.push((reason, 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (reason, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((reason, count));
        }
    }
    best
}

/// |A ∩ B| / |A ∪ B| over lower-cased whitespace tokens; 0 when either side is empty.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let left: BTreeSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let right: BTreeSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let common = left.intersection(&right).count();
    let all = left.union(&right).count();
    common as f64 / all as f64
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::llm::TokenUsage;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn engine() -> FusionEngine {
        FusionEngine::new(&FusionConfig::default()).unwrap()
    }

    fn finding(kind: FindingKind, severity: Severity, description: &str, confidence: f64, shard: &str) -> Finding {
        Finding {
            kind,
            severity,
            location: format!("in {shard}"),
            description: description.to_string(),
            recommendation: "fix it".to_string(),
            confidence,
            source_shard_ids: BTreeSet::from([shard.to_string()]),
            occurrence_count: 1,
        }
    }

    fn success(shard: &str, payload: &str) -> AnalysisOutcome {
        let mut outcome = AnalysisOutcome::failed(shard, "", FailureKind::Other, Duration::from_secs(2), 1);
        outcome.success = true;
        outcome.raw_payload = payload.to_string();
        outcome.failure_reason = None;
        outcome.failure_kind = None;
        outcome
    }

    fn failure(shard: &str, kind: FailureKind) -> AnalysisOutcome {
        AnalysisOutcome::failed(shard, "boom", kind, Duration::from_secs(1), 3)
    }

    #[test]
    fn similar_descriptions_merge() {
        let merged = engine().deduplicate(vec![
            finding(FindingKind::MissingItem, Severity::High, "missing temperature alarm", 0.9, "s1"),
            finding(FindingKind::MissingItem, Severity::High, "Missing temperature alarm signal", 0.7, "s2"),
        ]);

        assert_eq!(merged.len(), 1);
        let f = &merged[0];
        assert_eq!(f.occurrence_count, 2);
        assert!((f.confidence - 0.8).abs() < 1e-9);
        assert_eq!(f.source_shard_ids, BTreeSet::from(["s1".to_string(), "s2".to_string()]));
        assert_eq!(f.description, "missing temperature alarm (found in 2 locations)");
        assert_eq!(f.location, "in s1");
    }

    #[test]
    fn similarity_needs_half_the_tokens_in_common() {
        let engine = engine();
        let a = finding(FindingKind::MissingItem, Severity::High, "missing temperature alarm", 0.9, "s1");
        let b = finding(FindingKind::MissingItem, Severity::High, "missing temp alarm signal", 0.9, "s2");

        // 2 shared tokens out of 5: 0.6 + 0.4 * 0.4
        assert!((engine.similarity(&a, &b) - 0.76).abs() < 1e-9);
        assert_eq!(engine.deduplicate(vec![a, b]).len(), 2);
    }

    #[test]
    fn different_severities_never_merge() {
        let merged = engine().deduplicate(vec![
            finding(FindingKind::SafetyIssue, Severity::High, "no interlock", 0.9, "s1"),
            finding(FindingKind::SafetyIssue, Severity::Low, "no interlock", 0.9, "s2"),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn empty_descriptions_do_not_merge() {
        let merged = engine().deduplicate(vec![
            finding(FindingKind::Unknown, Severity::Low, "", 0.5, "s1"),
            finding(FindingKind::Unknown, Severity::Low, "", 0.5, "s2"),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn deduplication_is_idempotent() {
        let engine = engine();
        let input = vec![
            finding(FindingKind::MissingItem, Severity::High, "missing temperature alarm", 0.9, "s1"),
            finding(FindingKind::MissingItem, Severity::High, "missing temperature alarm signal", 0.7, "s2"),
            finding(FindingKind::MissingItem, Severity::High, "pressure sensor unchecked", 0.6, "s3"),
            finding(FindingKind::MissingItem, Severity::High, "pressure sensor unchecked here", 0.6, "s4"),
            finding(FindingKind::LogicError, Severity::Medium, "timer never reset", 0.4, "s1"),
        ];

        let once = engine.deduplicate(input);
        let twice = engine.deduplicate(once.clone());
        assert_eq!(once.len(), 3);
        assert_eq!(twice, once);
    }

    #[test]
    fn ranking_orders_by_severity_confidence_then_count() {
        let mut frequent = finding(FindingKind::LogicError, Severity::High, "b", 0.7, "s2");
        frequent.occurrence_count = 3;
        let ranked = engine().rank(vec![
            finding(FindingKind::LogicError, Severity::Low, "a", 1.0, "s1"),
            finding(FindingKind::LogicError, Severity::High, "c", 0.7, "s3"),
            frequent,
            finding(FindingKind::LogicError, Severity::Unknown, "d", 1.0, "s4"),
            finding(FindingKind::LogicError, Severity::Critical, "e", 0.1, "s5"),
            finding(FindingKind::LogicError, Severity::High, "f", 0.9, "s6"),
        ]);

        let order: Vec<&str> = ranked.iter().map(|f| f.description.as_str()).collect();
        assert_eq!(order, vec!["e", "f", "b", "c", "a", "d"]);
    }

    #[test]
    fn all_failed_yields_empty_report() {
        let outcomes = vec![failure("s1", FailureKind::Timeout), failure("s2", FailureKind::RateLimit)];
        let report = engine().fuse(&outcomes, AnalysisKind::Alarm);

        assert!(report.findings.is_empty());
        assert_eq!(report.overall_confidence, 0.0);
        assert!(report.statistics.is_none());
        assert_eq!(
            report.summary,
            "Analysis could not be completed: all 2 shard analyses failed (most common cause: boom, 2 of 2)"
        );
        assert_eq!(report.dispatch_summary.failed_shard_ids, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(report.dispatch_summary.error_summary[&FailureKind::Timeout], 1);
        assert_eq!(report.dispatch_summary.error_summary[&FailureKind::RateLimit], 1);
    }

    #[test]
    fn all_failed_summary_names_the_dominant_cause() {
        let missing_key = |shard: &str| {
            AnalysisOutcome::failed(
                shard,
                DispatchError::MissingApiKey.to_string(),
                DispatchError::MissingApiKey.failure_kind(),
                Duration::ZERO,
                1,
            )
        };
        let outcomes = vec![
            failure("s1", FailureKind::Timeout),
            missing_key("s2"),
            missing_key("s3"),
        ];
        let report = engine().fuse(&outcomes, AnalysisKind::Safety);

        assert!(report
            .summary
            .contains(&format!("most common cause: {}, 2 of 3", DispatchError::MissingApiKey)));
        assert_eq!(report.dispatch_summary.error.as_deref(), report.summary.strip_prefix("Analysis could not be completed: "));
    }

    #[test]
    fn confidence_without_findings_uses_success_rate_alone() {
        let outcomes = vec![
            success("s1", r#"{"findings": []}"#),
            success("s2", "nothing of note"),
            failure("s3", FailureKind::ApiError),
            failure("s4", FailureKind::Other),
        ];
        let report = engine().fuse(&outcomes, AnalysisKind::Logic);

        assert!(report.findings.is_empty());
        assert!((report.overall_confidence - 0.5).abs() < 1e-9);
        assert_eq!(report.summary, "No significant issues were found in this analysis.");
    }

    #[test]
    fn confidence_stays_in_bounds() {
        let mut config = FusionConfig::default();
        config.weights = ConfidenceWeights {
            success_rate: 5.0,
            finding_confidence: 0.0,
            consistency: 1.0,
        };
        let engine = FusionEngine::new(&config).unwrap();
        let mut frequent = finding(FindingKind::LogicError, Severity::High, "x", 1.0, "s1");
        frequent.occurrence_count = 10;

        for findings in [vec![], vec![frequent]] {
            for rate in [0.0, 0.3, 1.0] {
                let value = engine.overall_confidence(rate, &findings);
                assert!((0.0..=1.0).contains(&value), "{value}");
            }
        }
    }

    #[test]
    fn fuse_builds_statistics_and_summary() {
        let payload_a = r#"{"findings": [
            {"type": "missing_alarm", "severity": "high", "description": "missing temperature alarm", "confidence": 0.9},
            {"type": "logic_error", "severity": "critical", "description": "motor restarts after e-stop", "confidence": 0.8}
        ]}"#;
        let payload_b = r#"{"findings": [
            {"type": "missing_alarm", "severity": "high", "description": "missing temperature alarm signal", "confidence": 0.7}
        ]}"#;
        let mut a = success("prog_logic_001", payload_a);
        a.token_usage = Some(TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        });
        a.cached = true;
        let outcomes = vec![success("prog_logic_002", payload_b), a, failure("prog_logic_003", FailureKind::Timeout)];

        let report = engine().fuse(&outcomes, AnalysisKind::Alarm);

        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.findings[0].kind, FindingKind::LogicError);
        assert_eq!(report.findings[1].occurrence_count, 2);
        assert_eq!(report.findings[1].location, "unknown location");
        assert_eq!(
            report.findings[1].description,
            "missing temperature alarm (found in 2 locations)"
        );

        let stats = report.statistics.as_ref().unwrap();
        assert_eq!(stats.total_shards, 3);
        assert_eq!(stats.successful_shards, 2);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.total_findings, 2);
        assert_eq!(stats.finding_kinds[&FindingKind::MissingItem], 1);
        assert_eq!(stats.severity_counts[&Severity::Critical], 1);
        assert_eq!(stats.total_tokens, 120);
        assert_eq!(stats.total_elapsed_secs, 4.0);

        assert_eq!(report.dispatch_summary.cache_hits, 1);
        assert_eq!(report.dispatch_summary.failed_shard_ids, vec!["prog_logic_003".to_string()]);
        assert_eq!(
            report.summary,
            "Analysis found 2 issues. 1 critical. 1 high priority. Address the critical and high-priority issues first."
        );
        assert!(report.overall_confidence > 0.0 && report.overall_confidence <= 1.0);
    }

    #[test]
    fn summary_names_the_most_frequent_kind() {
        let findings = vec![
            finding(FindingKind::ExistingItem, Severity::Low, "a", 0.9, "s1"),
            finding(FindingKind::ExistingItem, Severity::Medium, "b", 0.9, "s2"),
            finding(FindingKind::LogicError, Severity::Low, "c", 0.9, "s3"),
        ];
        assert_eq!(
            engine().summarize(&findings),
            "Analysis found 3 issues. Most frequent type: existing items (2)."
        );
    }

    #[test]
    fn heuristic_findings_are_fused() {
        let outcomes = vec![success("s1", "The high level alarm is missing.")];
        let report = engine().fuse(&outcomes, AnalysisKind::Alarm);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::MissingItem);
        assert_eq!(report.findings[0].location, "shard s1");
    }
}
