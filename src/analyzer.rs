use crate::{
    config::Config,
    context::ContextAugmenter,
    dependency_graph::{DependencyAnalysis, DependencyGraph, GraphBuilder},
    dispatch::{AnalysisOutcome, OutcomeCache, Orchestrator},
    extractor::{Entity, ExtractionSummary, PlcXmlExtractor},
    fusion::{FusedReport, FusionEngine},
    llm::{AnalysisKind, DeepSeekClient, ReasoningClient},
    sharding::{PackingReport, Shard, ShardPacker},
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Everything decided before the reasoning service is involved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardPlan {
    pub extraction: ExtractionSummary,
    pub dependency_analysis: DependencyAnalysis,
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
    pub packing: PackingReport,
    pub shards: Vec<Shard>,
}

impl ShardPlan {
    pub fn print_summary(&self) {
        println!("📊 Shard Plan Summary");
        println!("=====================");
        println!("  Entities: {}", self.extraction.total_entities);
        for (category, count) in &self.extraction.counts {
            println!("    {}: {}", category.label(), count);
        }
        println!(
            "  Dependencies: {} edges, {} cycles",
            self.dependency_analysis.total_edges,
            self.dependency_analysis.cycles.len()
        );
        println!("  Shards: {}", self.packing.shard_count);
        for (group, count) in &self.packing.shards_per_group {
            println!("    {}: {}", group.label(), count);
        }
        if !self.packing.oversized_shards.is_empty() {
            println!("  Oversized shards: {}", self.packing.oversized_shards.join(", "));
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub plan: ShardPlan,
    pub outcomes: Vec<AnalysisOutcome>,
    pub report: FusedReport,
    pub duration: Duration,
}

/// Extraction, sharding, dispatch and fusion for one document.
pub struct Analyzer<C> {
    config: Config,
    extractor: PlcXmlExtractor,
    orchestrator: Orchestrator<C>,
    fusion: FusionEngine,
}

impl Analyzer<DeepSeekClient> {
    pub fn new(config: Config) -> Result<Self> {
        let client = Arc::new(DeepSeekClient::new(config.llm.clone())?);
        Self::with_client(config, client, Arc::new(OutcomeCache::new()))
    }
}

impl<C: ReasoningClient + 'static> Analyzer<C> {
    pub fn with_client(config: Config, client: Arc<C>, cache: Arc<OutcomeCache>) -> Result<Self> {
        let extractor = PlcXmlExtractor::new(&config.sharding)?;
        let orchestrator = Orchestrator::new(client, cache, config.dispatch.clone());
        let fusion = FusionEngine::new(&config.fusion)?;

        Ok(Self {
            config,
            extractor,
            orchestrator,
            fusion,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator<C> {
        &self.orchestrator
    }

    pub fn plan_file(&self, path: &Path) -> Result<ShardPlan> {
        let entities = self.extractor.extract_file(path)?;
        Ok(self.plan_entities(entities))
    }

    pub fn plan(&self, source: &str) -> Result<ShardPlan> {
        let entities = self.extractor.extract(source)?;
        Ok(self.plan_entities(entities))
    }

    /// Graph, ordering and packing over already extracted entities.
    pub fn plan_entities(&self, entities: Vec<Entity>) -> ShardPlan {
        let extraction = ExtractionSummary::from_entities(&entities);
        info!("Extracted {} entities", extraction.total_entities);

        let graph: DependencyGraph = GraphBuilder::new().build_graph(&entities);
        let dependency_analysis = graph.analyze();
        dependency_analysis.log_summary();

        let shared: Vec<Arc<Entity>> = entities.into_iter().map(Arc::new).collect();
        let augmenter = ContextAugmenter::new(&shared, self.config.sharding.context_summary_chars);
        let packer = ShardPacker::new(self.config.sharding.max_shard_tokens);
        let (shards, packing) = packer.pack(&shared, &graph, &augmenter);

        ShardPlan {
            extraction,
            dependency_analysis,
            dependencies: graph.to_adjacency(),
            packing,
            shards,
        }
    }

    pub async fn analyze_file(&self, path: &Path, kind: AnalysisKind) -> Result<AnalysisRun> {
        let plan = self.plan_file(path)?;
        Ok(self.analyze_plan(plan, kind).await)
    }

    pub async fn analyze_source(&self, source: &str, kind: AnalysisKind) -> Result<AnalysisRun> {
        let plan = self.plan(source)?;
        Ok(self.analyze_plan(plan, kind).await)
    }

    /// Dispatch and fusion never fail as a whole; failures end up in the report.
    pub async fn analyze_plan(&self, plan: ShardPlan, kind: AnalysisKind) -> AnalysisRun {
        let started = Instant::now();
        info!("Running {} analysis over {} shards", kind, plan.shards.len());

        let outcomes = self.orchestrator.dispatch(&plan.shards, kind).await;
        let report = self.fusion.fuse(&outcomes, kind);
        info!(
            "{} analysis finished with {} findings (confidence {:.2})",
            kind,
            report.findings.len(),
            report.overall_confidence
        );

        AnalysisRun {
            plan,
            outcomes,
            report,
            duration: started.elapsed(),
        }
    }
}

impl AnalysisRun {
    pub fn print_summary(&self) {
        let report = &self.report;
        let dispatch = &report.dispatch_summary;

        println!("📊 {} Analysis Summary", report.analysis_kind);
        println!("==========================");
        println!(
            "  Shards: {} total, {} succeeded, {} failed ({} from cache)",
            dispatch.total_shards, dispatch.successful_shards, dispatch.failed_shards, dispatch.cache_hits
        );
        for (kind, count) in &dispatch.error_summary {
            println!("    {}: {}", kind, count);
        }
        println!("  Findings: {}", report.findings.len());
        println!("  Overall confidence: {:.2}", report.overall_confidence);
        println!("\n  {}", report.summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::extractor::ShardGroup;
    use crate::llm::ServiceReply;
    use async_trait::async_trait;

    const DOCUMENT: &str = r#"<Project>
    <Variable Name="Speed" Type="REAL"/>
    <DataType Name="MotorState"><Member Name="Running" Type="BOOL"/></DataType>
    <FunctionBlock Name="MotorCtl">
        <Code>IF Speed > 10.0 THEN state := MotorState#Running; END_IF;</Code>
    </FunctionBlock>
    <Program Name="Main">
        <Code>MotorCtl(); </Code>
    </Program>
</Project>"#;

    struct EchoClient;

    #[async_trait]
    impl ReasoningClient for EchoClient {
        async fn analyze(&self, shard: &Shard, _kind: AnalysisKind) -> Result<ServiceReply, DispatchError> {
            Ok(ServiceReply {
                content: format!(
                    r#"{{"findings": [{{"type": "logic_error", "severity": "medium", "location": "{}", "description": "check {}"}}]}}"#,
                    shard.id,
                    shard.id
                ),
                usage: None,
            })
        }
    }

    fn analyzer() -> Analyzer<EchoClient> {
        Analyzer::with_client(Config::default(), Arc::new(EchoClient), Arc::new(OutcomeCache::new())).unwrap()
    }

    #[test]
    fn plan_groups_entities_and_resolves_dependencies() {
        let plan = analyzer().plan(DOCUMENT).unwrap();

        assert_eq!(plan.extraction.total_entities, 4);
        assert_eq!(plan.shards.len(), 2);
        assert_eq!(plan.shards[0].group, ShardGroup::DataDefinition);
        assert_eq!(plan.shards[1].entity_names(), vec!["MotorCtl", "Main"]);
        assert!(plan.dependencies["Main"].contains("MotorCtl"));
        assert!(plan.shards[1].external_dependencies.contains("Speed"));
        assert!(plan.shards[1].context.contains_key("Speed"));
    }

    #[tokio::test]
    async fn analysis_produces_one_finding_per_shard() {
        let run = analyzer().analyze_source(DOCUMENT, AnalysisKind::Logic).await.unwrap();

        assert_eq!(run.outcomes.len(), 2);
        assert_eq!(run.report.findings.len(), 2);
        assert_eq!(run.report.dispatch_summary.successful_shards, 2);
        assert!(run.report.overall_confidence > 0.0);
    }
}
