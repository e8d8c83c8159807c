use async_trait::async_trait;
use plc_examer::config::Config;
use plc_examer::dispatch::OutcomeCache;
use plc_examer::error::{DispatchError, FailureKind};
use plc_examer::findings::{FindingKind, Severity};
use plc_examer::llm::{AnalysisKind, ReasoningClient, ServiceReply, TokenUsage};
use plc_examer::sharding::Shard;
use plc_examer::{Analyzer, Reporter};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

const PLANT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Project>
    <GlobalVariables>
        <Variable Name="TankLevel" Type="REAL"/>
        <Variable Name="PumpRunning" Type="BOOL"/>
        <Variable Name="TankTemp" Type="REAL"/>
    </GlobalVariables>
    <DataTypes>
        <DataType Name="PumpConfig">
            <Member Name="MaxLevel" Type="REAL"/>
        </DataType>
    </DataTypes>
    <FunctionBlocks>
        <FunctionBlock Name="PumpCtl">
            <Code>
                IF TankLevel > 90.0 THEN
                    PumpRunning := FALSE;
                END_IF;
            </Code>
        </FunctionBlock>
    </FunctionBlocks>
    <Programs>
        <Program Name="TankProgram">
            <Code>
                PumpCtl();
                IF TankTemp > 80.0 THEN
                    PumpRunning := FALSE;
                END_IF;
            </Code>
        </Program>
        <Program Name="HeaterProgram">
            <Code>
                IF TankTemp > 95.0 THEN
                    PumpRunning := FALSE;
                END_IF;
            </Code>
        </Program>
    </Programs>
</Project>"#;

/// Answers per shard group; fails every shard whose id is listed.
struct ScriptedClient {
    failing: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn new(failing: &[&str]) -> Self {
        Self {
            failing: failing.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ReasoningClient for ScriptedClient {
    async fn analyze(&self, shard: &Shard, _kind: AnalysisKind) -> Result<ServiceReply, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&shard.id) {
            return Err(DispatchError::Api {
                status: 400,
                message: "bad request".to_string(),
            });
        }

        let content = if shard.id.starts_with("data_def") {
            "The tank temperature variable has no alarm; the high level warning is missing.".to_string()
        } else {
            format!(
                r#"Analysis result:
{{"analysis_type": "alarm", "findings": [
  {{"type": "missing_alarm", "severity": "high", "location": "{id}",
    "description": "missing tank temperature alarm", "recommendation": "add a high alarm", "confidence": 0.9}},
  {{"type": "logic_error", "severity": "critical", "location": "{id}",
    "description": "{id} restart", "recommendation": "latch the stop", "confidence": 0.8}}
], "summary": "ok", "confidence_score": 0.85}}"#,
                id = shard.id
            )
        };

        Ok(ServiceReply {
            content,
            usage: Some(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
            }),
        })
    }
}

fn config() -> Config {
    let mut config = Config::default();
    // Small enough that no two routines share a shard.
    config.sharding.max_shard_tokens = 130;
    config.dispatch.max_concurrent_requests = 2;
    config.dispatch.batch_size = 2;
    config.dispatch.batch_delay_ms = 1;
    config.dispatch.retry_delay_ms = 1;
    config
}

#[tokio::test]
async fn full_pipeline_merges_findings_across_shards() {
    let client = Arc::new(ScriptedClient::new(&[]));
    let analyzer = Analyzer::with_client(config(), Arc::clone(&client), Arc::new(OutcomeCache::new())).unwrap();

    let run = analyzer.analyze_source(PLANT, AnalysisKind::Alarm).await.unwrap();

    let shard_ids: Vec<&str> = run.plan.shards.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(shard_ids, vec!["data_def_001", "prog_logic_001", "prog_logic_002", "prog_logic_003"]);
    assert_eq!(run.plan.shards[1].entity_names(), vec!["PumpCtl"]);
    assert_eq!(run.plan.shards[2].entity_names(), vec!["HeaterProgram"]);
    // TankProgram calls PumpCtl, so it is placed after it.
    assert_eq!(run.plan.shards[3].entity_names(), vec!["TankProgram"]);
    assert!(run.plan.shards[3].external_dependencies.contains("PumpCtl"));
    assert!(run.plan.shards[3].context.contains_key("TankTemp"));

    assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    assert_eq!(run.outcomes.len(), 4);

    let report = &run.report;
    // The shard-specific logic errors stay apart, the identical missing alarms merge,
    // and the heuristic finding from the data shard stands alone.
    let critical: Vec<_> = report.findings.iter().filter(|f| f.severity == Severity::Critical).collect();
    assert_eq!(critical.len(), 3);
    assert_eq!(report.findings[0].severity, Severity::Critical);

    let merged = report
        .findings
        .iter()
        .find(|f| f.kind == FindingKind::MissingItem && f.severity == Severity::High)
        .unwrap();
    assert_eq!(merged.occurrence_count, 3);
    assert_eq!(merged.source_shard_ids.len(), 3);
    assert_eq!(merged.description, "missing tank temperature alarm (found in 3 locations)");

    assert!(report
        .findings
        .iter()
        .any(|f| f.kind == FindingKind::MissingItem && f.location == "shard data_def_001"));

    let stats = report.statistics.as_ref().unwrap();
    assert_eq!(stats.total_shards, 4);
    assert_eq!(stats.success_rate, 1.0);
    assert_eq!(stats.total_tokens, 600);
    assert!(report.overall_confidence > 0.0 && report.overall_confidence <= 1.0);
    assert!(report.summary.starts_with("Analysis found"));
}

#[tokio::test]
async fn failed_shards_are_reported_without_aborting_the_run() {
    let client = Arc::new(ScriptedClient::new(&["prog_logic_002"]));
    let analyzer = Analyzer::with_client(config(), client, Arc::new(OutcomeCache::new())).unwrap();

    let run = analyzer.analyze_source(PLANT, AnalysisKind::Alarm).await.unwrap();
    let dispatch = &run.report.dispatch_summary;

    assert_eq!(dispatch.total_shards, 4);
    assert_eq!(dispatch.failed_shards, 1);
    assert_eq!(dispatch.failed_shard_ids, vec!["prog_logic_002".to_string()]);
    assert_eq!(dispatch.error_summary.get(&FailureKind::ApiError), Some(&1));
    assert!(!run.report.findings.is_empty());
}

#[tokio::test]
async fn all_failures_yield_an_empty_report() {
    let ids = ["data_def_001", "prog_logic_001", "prog_logic_002", "prog_logic_003"];
    let analyzer =
        Analyzer::with_client(config(), Arc::new(ScriptedClient::new(&ids)), Arc::new(OutcomeCache::new())).unwrap();

    let run = analyzer.analyze_source(PLANT, AnalysisKind::Safety).await.unwrap();

    assert!(run.report.findings.is_empty());
    assert_eq!(run.report.overall_confidence, 0.0);
    assert!(run.report.summary.contains("all 4 shard analyses failed"));
}

#[tokio::test]
async fn shared_cache_avoids_repeat_calls() {
    let client = Arc::new(ScriptedClient::new(&[]));
    let cache = Arc::new(OutcomeCache::new());
    let analyzer = Analyzer::with_client(config(), Arc::clone(&client), Arc::clone(&cache)).unwrap();

    let first = analyzer.analyze_source(PLANT, AnalysisKind::Alarm).await.unwrap();
    let second = analyzer.analyze_source(PLANT, AnalysisKind::Alarm).await.unwrap();

    assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    assert_eq!(second.report.dispatch_summary.cache_hits, 4);
    assert_eq!(first.report.findings, second.report.findings);
}

#[tokio::test]
async fn reports_and_shards_are_written_to_disk() {
    let analyzer = Analyzer::with_client(
        config(),
        Arc::new(ScriptedClient::new(&[])),
        Arc::new(OutcomeCache::new()),
    )
    .unwrap();
    let input_dir = tempdir().unwrap();
    let input = input_dir.path().join("plant.xml");
    std::fs::write(&input, PLANT).unwrap();

    let run = analyzer.analyze_file(&input, AnalysisKind::Alarm).await.unwrap();
    let output = tempdir().unwrap();
    let reporter = Reporter::new();
    reporter.export_report(&run.report, output.path()).unwrap();
    reporter.export_shards(&run.plan, output.path()).unwrap();

    for name in [
        "analysis_report_alarm.json",
        "analysis_report_alarm.html",
        "analysis_summary_alarm.md",
        "shard_plan.json",
        "shards/data_def_001.json",
        "shards/prog_logic_003.json",
    ] {
        assert!(output.path().join(name).exists(), "{name} missing");
    }

    let shard: Shard =
        serde_json::from_str(&std::fs::read_to_string(output.path().join("shards/prog_logic_003.json")).unwrap())
            .unwrap();
    assert_eq!(shard.entity_names(), vec!["TankProgram"]);
}
