use crate::config::ShardingConfig;
use crate::error::ExtractError;
use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Structured-text keywords that look like identifiers but never name an entity.
const KEYWORDS: &[&str] = &[
    "VAR", "END_VAR", "VAR_INPUT", "VAR_OUTPUT", "VAR_IN_OUT", "VAR_GLOBAL", "VAR_TEMP",
    "TYPE", "END_TYPE", "STRUCT", "END_STRUCT", "FUNCTION", "END_FUNCTION",
    "FUNCTION_BLOCK", "END_FUNCTION_BLOCK", "PROGRAM", "END_PROGRAM", "IF", "THEN",
    "ELSE", "ELSIF", "END_IF", "FOR", "TO", "BY", "DO", "END_FOR", "WHILE", "END_WHILE",
    "REPEAT", "UNTIL", "END_REPEAT", "CASE", "OF", "END_CASE", "AND", "OR", "XOR", "NOT",
    "MOD", "TRUE", "FALSE", "RETURN", "EXIT",
];

/// Names listed per category in the extraction summary.
const SUMMARY_NAME_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityCategory {
    GlobalVariable,
    DataType,
    FunctionBlock,
    Program,
}

/// The two shard families entities are packed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardGroup {
    DataDefinition,
    ProgramLogic,
}

impl EntityCategory {
    pub fn group(&self) -> ShardGroup {
        match self {
            EntityCategory::GlobalVariable | EntityCategory::DataType => ShardGroup::DataDefinition,
            EntityCategory::FunctionBlock | EntityCategory::Program => ShardGroup::ProgramLogic,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntityCategory::GlobalVariable => "GlobalVariable",
            EntityCategory::DataType => "DataType",
            EntityCategory::FunctionBlock => "FunctionBlock",
            EntityCategory::Program => "Program",
        }
    }
}

impl ShardGroup {
    pub const ALL: [ShardGroup; 2] = [ShardGroup::DataDefinition, ShardGroup::ProgramLogic];

    pub fn id_prefix(&self) -> &'static str {
        match self {
            ShardGroup::DataDefinition => "data_def",
            ShardGroup::ProgramLogic => "prog_logic",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ShardGroup::DataDefinition => "data_definition",
            ShardGroup::ProgramLogic => "program_logic",
        }
    }
}

/// A named unit of the PLC program: a variable, a type or a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub category: EntityCategory,
    pub raw_text: String,
    pub raw_dependency_tokens: BTreeSet<String>,
    pub size_metric: usize,
    pub line_start: usize,
    pub line_end: usize,
}

impl Entity {
    /// Builds an entity directly; used by callers that bring their own extraction.
    pub fn new(
        name: impl Into<String>,
        category: EntityCategory,
        raw_text: impl Into<String>,
        dependency_tokens: impl IntoIterator<Item = impl Into<String>>,
        size_metric: usize,
    ) -> Self {
        let raw_text = raw_text.into();
        let line_end = raw_text.lines().count().max(1);
        Self {
            name: name.into(),
            category,
            raw_text,
            raw_dependency_tokens: dependency_tokens.into_iter().map(Into::into).collect(),
            size_metric,
            line_start: 1,
            line_end,
        }
    }
}

/// Counts and names per category, mirroring what the document contained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub total_entities: usize,
    pub counts: BTreeMap<EntityCategory, usize>,
    pub names: BTreeMap<EntityCategory, Vec<String>>,
}

impl ExtractionSummary {
    pub fn from_entities(entities: &[Entity]) -> Self {
        let mut summary = ExtractionSummary {
            total_entities: entities.len(),
            ..Default::default()
        };
        for entity in entities {
            *summary.counts.entry(entity.category).or_insert(0) += 1;
            let names = summary.names.entry(entity.category).or_default();
            if names.len() < SUMMARY_NAME_LIMIT {
                names.push(entity.name.clone());
            }
        }
        summary
    }
}

/// Byte span of an element that names an entity.
#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    category: EntityCategory,
    start: usize,
    end: usize,
}

struct OpenElement {
    candidate: Option<(String, EntityCategory)>,
    start: usize,
}

pub struct PlcXmlExtractor {
    identifier_pattern: Regex,
    prefixed_patterns: Vec<Regex>,
    keywords: HashSet<&'static str>,
    tokens_per_line: usize,
}

impl PlcXmlExtractor {
    pub fn new(config: &ShardingConfig) -> Result<Self> {
        Ok(Self {
            identifier_pattern: Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\b")?,
            prefixed_patterns: vec![
                Regex::new(r"(?i)\bFB_(\w+)")?,
                Regex::new(r"(?i)\bGVL\.(\w+)")?,
            ],
            keywords: KEYWORDS.iter().copied().collect(),
            tokens_per_line: config.tokens_per_line,
        })
    }

    pub fn extract_file(&self, path: &Path) -> Result<Vec<Entity>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading PLC XML file {}", path.display()))?;
        info!("Extracting entities from {}", path.display());
        Ok(self.extract(&content)?)
    }

    /// Extracts entities in document order; the first element with a given name wins.
    pub fn extract(&self, source: &str) -> std::result::Result<Vec<Entity>, ExtractError> {
        let mut candidates = self.scan_candidates(source)?;
        candidates.sort_by_key(|c| c.start);

        let mut seen = HashSet::new();
        candidates.retain(|c| {
            let fresh = seen.insert(c.name.clone());
            if !fresh {
                debug!("Skipping duplicate element name {}", c.name);
            }
            fresh
        });

        if candidates.is_empty() {
            return Err(ExtractError::Empty);
        }

        let line_index = LineIndex::new(source);
        let entities: Vec<Entity> = candidates
            .par_iter()
            .map(|candidate| self.build_entity(source, candidate, &line_index))
            .collect();

        let summary = ExtractionSummary::from_entities(&entities);
        for (category, count) in &summary.counts {
            info!("Extracted {} {} entities", count, category.label());
        }

        Ok(entities)
    }

    fn scan_candidates(&self, source: &str) -> std::result::Result<Vec<Candidate>, ExtractError> {
        let mut reader = XmlReader::from_str(source);
        let mut stack: Vec<OpenElement> = Vec::new();
        let mut candidates = Vec::new();

        loop {
            let start = reader.buffer_position();
            let event = reader.read_event().map_err(|err| ExtractError::Syntax {
                position: reader.buffer_position(),
                message: err.to_string(),
            })?;

            match event {
                Event::Start(ref e) => {
                    let candidate = self.classify(e, &stack);
                    stack.push(OpenElement { candidate, start });
                }
                Event::Empty(ref e) => {
                    if let Some((name, category)) = self.classify(e, &stack) {
                        candidates.push(Candidate {
                            name,
                            category,
                            start,
                            end: reader.buffer_position(),
                        });
                    }
                }
                Event::End(_) => {
                    if let Some(open) = stack.pop() {
                        if let Some((name, category)) = open.candidate {
                            candidates.push(Candidate {
                                name,
                                category,
                                start: open.start,
                                end: reader.buffer_position(),
                            });
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(candidates)
    }

    /// Maps an element to an entity category when it carries a name.
    fn classify(&self, element: &BytesStart, stack: &[OpenElement]) -> Option<(String, EntityCategory)> {
        let local_name = String::from_utf8_lossy(element.local_name().as_ref()).to_ascii_lowercase();

        let category = match local_name.as_str() {
            "globalvariable" | "variable" => EntityCategory::GlobalVariable,
            "datatype" => EntityCategory::DataType,
            "functionblock" | "fb" => EntityCategory::FunctionBlock,
            "program" => EntityCategory::Program,
            "pou" => match attribute(element, &["pouType", "PouType", "poutype"]).as_deref() {
                Some("functionBlock") | Some("function") => EntityCategory::FunctionBlock,
                _ => EntityCategory::Program,
            },
            _ => return None,
        };

        // Variables declared inside a routine or a struct type belong to their owner.
        if category == EntityCategory::GlobalVariable && stack.iter().any(|open| open.candidate.is_some()) {
            return None;
        }

        let name = attribute(element, &["Name", "name", "Id", "id"])?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name.to_string(), category))
    }

    fn build_entity(&self, source: &str, candidate: &Candidate, lines: &LineIndex) -> Entity {
        let raw_text = source[candidate.start..candidate.end].to_string();
        let raw_dependency_tokens = self.dependency_tokens(&raw_text);
        let size_metric = self.estimate_tokens(&raw_text);

        Entity {
            name: candidate.name.clone(),
            category: candidate.category,
            raw_dependency_tokens,
            size_metric,
            line_start: lines.line_of(candidate.start),
            line_end: lines.line_of(candidate.end.saturating_sub(1)),
            raw_text,
        }
    }

    /// Every identifier-like token in the text; resolution against known names happens later.
    pub fn dependency_tokens(&self, content: &str) -> BTreeSet<String> {
        let mut tokens: BTreeSet<String> = self
            .identifier_pattern
            .find_iter(content)
            .map(|m| m.as_str().to_string())
            .collect();

        for pattern in &self.prefixed_patterns {
            for captures in pattern.captures_iter(content) {
                if let Some(m) = captures.get(1) {
                    tokens.insert(m.as_str().to_string());
                }
            }
        }

        tokens.retain(|token| {
            token.len() > 1 && !self.keywords.contains(token.to_ascii_uppercase().as_str())
        });
        tokens
    }

    pub fn estimate_tokens(&self, content: &str) -> usize {
        content.lines().filter(|line| !line.trim().is_empty()).count() * self.tokens_per_line
    }
}

fn attribute(element: &BytesStart, keys: &[&str]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| keys.iter().any(|key| attr.key.local_name().as_ref() == key.as_bytes()))
        .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
}

/// Byte offset to 1-based line number lookup.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { starts }
    }

    fn line_of(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(line) => line + 1,
            Err(next) => next,
        }
    }
}
