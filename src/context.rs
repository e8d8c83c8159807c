use crate::extractor::{Entity, EntityCategory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

const ELLIPSIS: &str = "...";

/// Short description of a dependency that lives outside the shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub category: EntityCategory,
    pub summary: String,
}

/// Looks up external dependencies of a shard and summarizes them.
pub struct ContextAugmenter {
    entities: HashMap<String, Arc<Entity>>,
    max_chars: usize,
}

impl ContextAugmenter {
    pub fn new(entities: &[Arc<Entity>], max_chars: usize) -> Self {
        let mut index = HashMap::with_capacity(entities.len());
        for entity in entities {
            index
                .entry(entity.name.clone())
                .or_insert_with(|| Arc::clone(entity));
        }
        Self {
            entities: index,
            max_chars,
        }
    }

    /// Context entries for the given dependency names; unknown names are omitted.
    pub fn context_for(&self, dependencies: &BTreeSet<String>) -> BTreeMap<String, ContextEntry> {
        dependencies
            .iter()
            .filter_map(|name| {
                self.entities.get(name).map(|entity| {
                    (
                        name.clone(),
                        ContextEntry {
                            category: entity.category,
                            summary: truncate_with_ellipsis(&entity.raw_text, self.max_chars),
                        },
                    )
                })
            })
            .collect()
    }
}

/// Keeps the first `max_chars` characters, marking the cut with `...`.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &text[..cut], ELLIPSIS),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, text: &str) -> Arc<Entity> {
        Arc::new(Entity::new(name, EntityCategory::DataType, text, Vec::<String>::new(), 1))
    }

    #[test]
    fn short_text_is_kept_verbatim() {
        assert_eq!(truncate_with_ellipsis("abc", 3), "abc");
        assert_eq!(truncate_with_ellipsis("abcd", 3), "abc...");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_with_ellipsis("温度报警配置", 2), "温度...");
    }

    #[test]
    fn unknown_dependencies_are_omitted() {
        let augmenter = ContextAugmenter::new(&[entity("AlarmConfig", &"x".repeat(300))], 200);
        let deps = BTreeSet::from(["AlarmConfig".to_string(), "Unknown".to_string()]);

        let context = augmenter.context_for(&deps);
        assert_eq!(context.len(), 1);
        let entry = &context["AlarmConfig"];
        assert_eq!(entry.category, EntityCategory::DataType);
        assert_eq!(entry.summary.chars().count(), 203);
        assert!(entry.summary.ends_with("..."));
    }
}
