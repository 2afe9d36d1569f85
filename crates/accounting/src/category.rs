use crate::AuditError;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashSet;

/// A user-defined entry label driven by regular expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub patterns: Vec<String>,
    /// Match against on-chain transaction labels.
    pub on_chain: bool,
    /// Match against invoice memos.
    pub off_chain: bool,
}

#[derive(Debug)]
struct CompiledCategory {
    name: String,
    patterns: Vec<Regex>,
    on_chain: bool,
    off_chain: bool,
}

/// The validated category set of one report, with every pattern compiled
/// once. Declaration order is preserved: the first matching category wins,
/// so an entry never carries more than one label.
#[derive(Debug)]
pub struct CompiledCategories {
    categories: Vec<CompiledCategory>,
}

impl CompiledCategories {
    pub fn new(categories: &[Category]) -> Result<Self, AuditError> {
        let mut seen_patterns = HashSet::new();
        let mut compiled = Vec::with_capacity(categories.len());

        for category in categories {
            if category.name.is_empty() {
                return Err(AuditError::InvalidInput(
                    "category name must not be empty".to_string(),
                ));
            }
            if !category.on_chain && !category.off_chain {
                return Err(AuditError::InvalidInput(format!(
                    "category {} matches neither on-chain nor off-chain entries",
                    category.name
                )));
            }

            let mut patterns = Vec::with_capacity(category.patterns.len());
            for pattern in &category.patterns {
                // Uniqueness is global: the same pattern in two categories
                // would make the winning label depend on declaration order
                // in a way the user almost certainly did not intend.
                if !seen_patterns.insert(pattern.clone()) {
                    return Err(AuditError::InvalidInput(format!(
                        "duplicate category pattern: {pattern}"
                    )));
                }

                let regex = Regex::new(pattern).map_err(|e| {
                    AuditError::InvalidInput(format!("invalid pattern {pattern}: {e}"))
                })?;
                patterns.push(regex);
            }

            compiled.push(CompiledCategory {
                name: category.name.clone(),
                patterns,
                on_chain: category.on_chain,
                off_chain: category.off_chain,
            });
        }

        Ok(Self {
            categories: compiled,
        })
    }

    /// The label for an entry whose match text is `text`, if any category
    /// applies. `on_chain` selects which categories are eligible.
    pub fn label_for(&self, text: &str, on_chain: bool) -> Option<&str> {
        self.categories
            .iter()
            .filter(|category| {
                if on_chain {
                    category.on_chain
                } else {
                    category.off_chain
                }
            })
            .find(|category| category.patterns.iter().any(|pattern| pattern.is_match(text)))
            .map(|category| category.name.as_str())
    }
}
