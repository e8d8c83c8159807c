use crate::{
    analyzer::ShardPlan,
    dependency_graph::DependencyAnalysis,
    extractor::{ExtractionSummary, ShardGroup},
    findings::Finding,
    fusion::FusedReport,
    sharding::PackingReport,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

/// Index written next to the per-shard exports.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShardPlanIndex {
    pub generated_at: String,
    pub extraction: ExtractionSummary,
    pub dependency_analysis: DependencyAnalysis,
    pub packing: PackingReport,
    pub shards: Vec<ShardIndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShardIndexEntry {
    pub id: String,
    pub group: ShardGroup,
    pub entities: Vec<String>,
    pub external_dependencies: usize,
    pub total_size: usize,
    pub line_start: usize,
    pub line_end: usize,
    pub file: String,
}

pub struct Reporter;

impl Reporter {
    pub fn new() -> Self {
        Self
    }

    /// Writes the JSON, HTML and Markdown renderings of a report.
    pub fn export_report(&self, report: &FusedReport, output_dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating output directory {}", output_dir.display()))?;
        let kind = report.analysis_kind.as_str();
        let mut exported_files = Vec::new();

        let json_path = output_dir.join(format!("analysis_report_{}.json", kind));
        fs::write(&json_path, serde_json::to_string_pretty(report)?)?;
        exported_files.push(json_path);

        let html_path = output_dir.join(format!("analysis_report_{}.html", kind));
        fs::write(&html_path, self.generate_html_report(report))?;
        exported_files.push(html_path);

        let md_path = output_dir.join(format!("analysis_summary_{}.md", kind));
        fs::write(&md_path, self.generate_markdown_summary(report))?;
        exported_files.push(md_path);

        info!("Exported {} report files to {}", exported_files.len(), output_dir.display());
        Ok(exported_files)
    }

    /// Writes every shard to `shards/{id}.json` plus a `shard_plan.json` index.
    pub fn export_shards(&self, plan: &ShardPlan, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let shard_dir = output_dir.join("shards");
        fs::create_dir_all(&shard_dir)
            .with_context(|| format!("creating shard directory {}", shard_dir.display()))?;

        let mut exported_files = Vec::with_capacity(plan.shards.len() + 1);
        let mut entries = Vec::with_capacity(plan.shards.len());
        for shard in &plan.shards {
            let file_name = format!("{}.json", shard.id);
            let path = shard_dir.join(&file_name);
            fs::write(&path, serde_json::to_string_pretty(shard)?)?;
            exported_files.push(path);

            entries.push(ShardIndexEntry {
                id: shard.id.clone(),
                group: shard.group,
                entities: shard.entity_names().into_iter().map(String::from).collect(),
                external_dependencies: shard.external_dependencies.len(),
                total_size: shard.total_size,
                line_start: shard.line_start,
                line_end: shard.line_end,
                file: format!("shards/{}", file_name),
            });
        }

        let index = ShardPlanIndex {
            generated_at: chrono::Utc::now().to_rfc3339(),
            extraction: plan.extraction.clone(),
            dependency_analysis: plan.dependency_analysis.clone(),
            packing: plan.packing.clone(),
            shards: entries,
        };
        let index_path = output_dir.join("shard_plan.json");
        fs::write(&index_path, serde_json::to_string_pretty(&index)?)?;
        exported_files.push(index_path);

        info!("Exported {} shards to {}", plan.shards.len(), shard_dir.display());
        Ok(exported_files)
    }

    fn generate_html_report(&self, report: &FusedReport) -> String {
        let findings_html = if report.findings.is_empty() {
            "<p>No findings.</p>".to_string()
        } else {
            report
                .findings
                .iter()
                .enumerate()
                .map(|(i, finding)| self.finding_html(i + 1, finding))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let statistics_html = match &report.statistics {
            Some(stats) => {
                let mut rows = vec![
                    ("Total shards", stats.total_shards.to_string()),
                    ("Successful shards", stats.successful_shards.to_string()),
                    ("Success rate", format!("{:.1}%", stats.success_rate * 100.0)),
                    ("Total findings", stats.total_findings.to_string()),
                    ("Average confidence", format!("{:.2}", stats.average_confidence)),
                    ("Total processing time", format!("{:.1}s", stats.total_elapsed_secs)),
                    ("Average processing time", format!("{:.1}s", stats.average_elapsed_secs)),
                    ("Tokens used", stats.total_tokens.to_string()),
                ];
                for (kind, count) in &stats.finding_kinds {
                    rows.push(("Findings", format!("{}: {}", kind, count)));
                }
                for (severity, count) in &stats.severity_counts {
                    rows.push(("Severity", format!("{}: {}", severity, count)));
                }
                rows.into_iter()
                    .map(|(key, value)| format!("<tr><td>{}</td><td>{}</td></tr>", key, escape_html(&value)))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            None => "<tr><td colspan=\"2\">No statistics available</td></tr>".to_string(),
        };

        let dispatch = &report.dispatch_summary;
        let failed_html = if dispatch.failed_shard_ids.is_empty() {
            String::new()
        } else {
            format!(
                "<p><strong>Failed shards:</strong> {}</p>",
                escape_html(&dispatch.failed_shard_ids.join(", "))
            )
        };

        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>PLC Analysis Report - {kind}</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; line-height: 1.6; }}
        .header {{ border-bottom: 2px solid #333; padding-bottom: 20px; }}
        .section {{ margin: 30px 0; }}
        .summary {{ background: #f5f5f5; padding: 15px; border-radius: 5px; }}
        .finding {{ margin: 15px 0; padding: 15px; border-left: 5px solid #007acc; background: #f9f9f9; }}
        .severity-critical {{ border-left-color: #f44336; background: #ffebee; }}
        .severity-high {{ border-left-color: #ff9800; background: #fff3e0; }}
        .severity-medium {{ border-left-color: #9c27b0; background: #f3e5f5; }}
        .severity-low {{ border-left-color: #4caf50; background: #e8f5e8; }}
        .confidence {{ font-weight: bold; color: #2196f3; }}
        table {{ width: 100%; border-collapse: collapse; }}
        th, td {{ padding: 8px; text-align: left; border-bottom: 1px solid #ddd; }}
    </style>
</head>
<body>
    <div class="header">
        <h1>PLC Analysis Report</h1>
        <p><strong>Analysis type:</strong> {kind}</p>
        <p><strong>Generated:</strong> {timestamp}</p>
        <p><strong>Overall confidence:</strong> <span class="confidence">{confidence:.2}</span></p>
    </div>

    <div class="section summary">
        <h2>Summary</h2>
        <p>{summary}</p>
    </div>

    <div class="section">
        <h2>Findings ({count})</h2>
        {findings}
    </div>

    <div class="section">
        <h2>Statistics</h2>
        <table>
            <tr><th>Metric</th><th>Value</th></tr>
            {statistics}
        </table>
    </div>

    <div class="section">
        <h2>Dispatch</h2>
        <p>{successful} of {total} shards analyzed successfully, {cached} served from cache.</p>
        {failed}
    </div>
</body>
</html>"#,
            kind = report.analysis_kind,
            timestamp = escape_html(&report.timestamp),
            confidence = report.overall_confidence,
            summary = escape_html(&report.summary),
            count = report.findings.len(),
            findings = findings_html,
            statistics = statistics_html,
            successful = dispatch.successful_shards,
            total = dispatch.total_shards,
            cached = dispatch.cache_hits,
            failed = failed_html,
        )
    }

    fn finding_html(&self, index: usize, finding: &Finding) -> String {
        format!(
            r#"<div class="finding severity-{severity}">
            <h3>#{index}: {kind}</h3>
            <p><strong>Severity:</strong> {severity}</p>
            <p><strong>Location:</strong> {location}</p>
            <p><strong>Description:</strong> {description}</p>
            <p><strong>Recommendation:</strong> {recommendation}</p>
            <p><strong>Confidence:</strong> {confidence:.2} | <strong>Occurrences:</strong> {occurrences} | <strong>Shards:</strong> {shards}</p>
        </div>"#,
            severity = finding.severity,
            index = index,
            kind = finding.kind,
            location = escape_html(&finding.location),
            description = escape_html(&finding.description),
            recommendation = escape_html(&finding.recommendation),
            confidence = finding.confidence,
            occurrences = finding.occurrence_count,
            shards = escape_html(&finding.source_shard_ids.iter().cloned().collect::<Vec<_>>().join(", ")),
        )
    }

    fn generate_markdown_summary(&self, report: &FusedReport) -> String {
        let mut md = format!(
            "# PLC Analysis Summary\n\n**Analysis type:** {}\n**Generated:** {}\n**Overall confidence:** {:.2}\n\n",
            report.analysis_kind, report.timestamp, report.overall_confidence
        );

        md.push_str("## Summary\n\n");
        md.push_str(&report.summary);
        md.push_str("\n\n");

        if let Some(stats) = &report.statistics {
            md.push_str("## Statistics\n\n");
            md.push_str(&format!(
                "- **Shards:** {} analyzed, {} successful ({:.1}%)\n",
                stats.total_shards,
                stats.successful_shards,
                stats.success_rate * 100.0
            ));
            md.push_str(&format!("- **Findings:** {}\n", stats.total_findings));
            md.push_str(&format!("- **Average confidence:** {:.2}\n", stats.average_confidence));
            md.push_str(&format!("- **Tokens used:** {}\n\n", stats.total_tokens));
        }

        md.push_str("## Findings\n\n");
        if report.findings.is_empty() {
            md.push_str("No findings.\n");
        }
        for (i, finding) in report.findings.iter().enumerate() {
            md.push_str(&format!(
                "{}. **[{}] {}** at {}\n   {}\n   *Recommendation:* {}\n   (confidence {:.2}, {} occurrences)\n\n",
                i + 1,
                finding.severity,
                finding.kind,
                finding.location,
                finding.description,
                finding.recommendation,
                finding.confidence,
                finding.occurrence_count
            ));
        }

        let dispatch = &report.dispatch_summary;
        if !dispatch.failed_shard_ids.is_empty() {
            md.push_str("## Failed Shards\n\n");
            for id in &dispatch.failed_shard_ids {
                md.push_str(&format!("- {}\n", id));
            }
            for (kind, count) in &dispatch.error_summary {
                md.push_str(&format!("- **{}:** {}\n", kind, count));
            }
        }

        md
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfig;
    use crate::error::FailureKind;
    use crate::findings::{FindingKind, Severity};
    use crate::fusion::{DispatchSummary, FusionEngine};
    use crate::llm::AnalysisKind;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn report() -> FusedReport {
        let mut report = FusionEngine::new(&FusionConfig::default())
            .unwrap()
            .empty_report(AnalysisKind::Safety, "nothing ran", DispatchSummary::default());
        report.summary = "Analysis found 1 issues.".to_string();
        report.findings.push(Finding {
            kind: FindingKind::SafetyIssue,
            severity: Severity::Critical,
            location: "<E-Stop> handler".to_string(),
            description: "reset & restart without acknowledgement".to_string(),
            recommendation: "latch the fault".to_string(),
            confidence: 0.9,
            source_shard_ids: BTreeSet::from(["prog_logic_001".to_string()]),
            occurrence_count: 1,
        });
        report.dispatch_summary.failed_shard_ids.push("prog_logic_002".to_string());
        report.dispatch_summary.error_summary.insert(FailureKind::Timeout, 1);
        report
    }

    #[test]
    fn exports_three_files_named_by_kind() {
        let dir = tempdir().unwrap();
        let files = Reporter::new().export_report(&report(), dir.path()).unwrap();

        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "analysis_report_safety.json",
                "analysis_report_safety.html",
                "analysis_summary_safety.md"
            ]
        );

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&files[0]).unwrap()).unwrap();
        assert_eq!(json["analysis_kind"], "safety");
        assert_eq!(json["findings"][0]["kind"], "safety_issue");
    }

    #[test]
    fn html_escapes_service_text() {
        let html = Reporter::new().generate_html_report(&report());
        assert!(html.contains("&lt;E-Stop&gt; handler"));
        assert!(html.contains("reset &amp; restart"));
        assert!(html.contains("severity-critical"));
        assert!(html.contains("Failed shards:</strong> prog_logic_002"));
    }

    #[test]
    fn markdown_lists_findings_and_failures() {
        let md = Reporter::new().generate_markdown_summary(&report());
        assert!(md.contains("1. **[critical] safety_issue** at <E-Stop> handler"));
        assert!(md.contains("- prog_logic_002"));
        assert!(md.contains("- **timeout:** 1"));
    }
}
