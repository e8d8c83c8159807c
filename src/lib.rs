pub mod config;
pub mod error;
pub mod extractor;
pub mod dependency_graph;
pub mod context;
pub mod sharding;
pub mod llm;
pub mod dispatch;
pub mod findings;
pub mod fusion;
pub mod analyzer;
pub mod reporter;

pub use config::Config;
pub use error::{DispatchError, ExtractError, FailureKind};
pub use extractor::{Entity, EntityCategory, PlcXmlExtractor};
pub use dependency_graph::DependencyGraph;
pub use sharding::{Shard, ShardPacker};
pub use llm::{AnalysisKind, DeepSeekClient, ReasoningClient};
pub use dispatch::{AnalysisOutcome, OutcomeCache, Orchestrator};
pub use findings::{Finding, FindingKind, Severity};
pub use fusion::{FusedReport, FusionEngine};
pub use analyzer::Analyzer;
pub use reporter::Reporter;

pub type Result<T> = anyhow::Result<T>;
