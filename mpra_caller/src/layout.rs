use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};

const DEFAULT_RNA_PATTERN: &str = r"^(?P<condition>.+)_RNA_r?(?P<replicate>\d+)$";
const DEFAULT_DNA_PATTERN: &str = r"^(?:(?P<condition>.+)_)?DNA_r?(?P<replicate>\d+)$";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateChannel {
    pub replicate: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionLayout {
    pub name: String,
    pub dna_channels: Vec<String>,
    pub rna_channels: Vec<ReplicateChannel>,
}

/// Validated layout. Every condition has a DNA pool and at least one RNA
/// replicate, and no RNA column serves two (condition, replicate) slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssayLayout {
    conditions: Vec<ConditionLayout>,
}

impl AssayLayout {
    pub fn new(conditions: Vec<ConditionLayout>) -> PipelineResult<Self> {
        if conditions.is_empty() {
            return Err(PipelineError::Layout("no conditions defined".into()));
        }

        let mut names = HashSet::new();
        let mut rna_owner: HashMap<&str, &str> = HashMap::new();
        let dna: HashSet<&str> = conditions
            .iter()
            .flat_map(|c| c.dna_channels.iter().map(String::as_str))
            .collect();

        for condition in &conditions {
            if !names.insert(condition.name.as_str()) {
                return Err(PipelineError::Layout(format!(
                    "condition `{}` defined twice",
                    condition.name
                )));
            }
            if condition.dna_channels.is_empty() {
                return Err(PipelineError::Layout(format!(
                    "condition `{}` has no DNA channel",
                    condition.name
                )));
            }
            if condition.rna_channels.is_empty() {
                return Err(PipelineError::Layout(format!(
                    "condition `{}` has no RNA channel",
                    condition.name
                )));
            }

            let mut replicates = HashSet::new();
            for channel in &condition.rna_channels {
                if !replicates.insert(channel.replicate.as_str()) {
                    return Err(PipelineError::Layout(format!(
                        "replicate `{}` appears twice in condition `{}`",
                        channel.replicate, condition.name
                    )));
                }
                if dna.contains(channel.column.as_str()) {
                    return Err(PipelineError::Layout(format!(
                        "column `{}` is used both as DNA and as RNA",
                        channel.column
                    )));
                }
                if let Some(owner) = rna_owner.insert(channel.column.as_str(), condition.name.as_str()) {
                    return Err(PipelineError::Layout(format!(
                        "RNA column `{}` is assigned to `{}` and `{}`",
                        channel.column, owner, condition.name
                    )));
                }
            }
        }

        Ok(Self { conditions })
    }

    pub fn conditions(&self) -> &[ConditionLayout] {
        &self.conditions
    }

    pub fn condition(&self, name: &str) -> Option<&ConditionLayout> {
        self.conditions.iter().find(|c| c.name == name)
    }

    /// Every raw count column, DNA first, without duplicates.
    pub fn count_channels(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let dna = self
            .conditions
            .iter()
            .flat_map(|c| c.dna_channels.iter().map(String::as_str));
        let rna = self
            .conditions
            .iter()
            .flat_map(|c| c.rna_channels.iter().map(|r| r.column.as_str()));
        dna.chain(rna).filter(|c| seen.insert(*c)).collect()
    }

    /// Copy of the layout with the given RNA columns removed. Fails if a
    /// condition is left without replicates.
    pub fn without_rna_channels(&self, excluded: &[String]) -> PipelineResult<Self> {
        let conditions = self
            .conditions
            .iter()
            .map(|c| ConditionLayout {
                name: c.name.clone(),
                dna_channels: c.dna_channels.clone(),
                rna_channels: c
                    .rna_channels
                    .iter()
                    .filter(|r| !excluded.contains(&r.column))
                    .cloned()
                    .collect(),
            })
            .collect();
        Self::new(conditions)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Explicit layout; inferred from the header when empty.
    pub conditions: Vec<ConditionLayout>,
    pub rna_pattern: String,
    pub dna_pattern: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            conditions: Vec::new(),
            rna_pattern: DEFAULT_RNA_PATTERN.to_string(),
            dna_pattern: DEFAULT_DNA_PATTERN.to_string(),
        }
    }
}

impl LayoutConfig {
    pub fn resolve(&self, header: &[&str]) -> PipelineResult<AssayLayout> {
        let layout = if self.conditions.is_empty() {
            self.infer(header)?
        } else {
            AssayLayout::new(self.conditions.clone())?
        };

        for column in layout.count_channels() {
            if !header.contains(&column) {
                return Err(PipelineError::MissingColumn(column.to_string()));
            }
        }

        for condition in layout.conditions() {
            info!(
                "Condition {}: {} DNA channel(s), {} RNA replicate(s)",
                condition.name,
                condition.dna_channels.len(),
                condition.rna_channels.len()
            );
        }
        Ok(layout)
    }

    fn infer(&self, header: &[&str]) -> PipelineResult<AssayLayout> {
        let rna_re = Regex::new(&self.rna_pattern)?;
        let dna_re = Regex::new(&self.dna_pattern)?;

        let mut conditions: Vec<ConditionLayout> = Vec::new();
        let mut shared_dna: Vec<String> = Vec::new();
        let mut bound_dna: Vec<(String, String)> = Vec::new();

        for &column in header {
            if let Some(caps) = rna_re.captures(column) {
                let (Some(condition), Some(replicate)) = (caps.name("condition"), caps.name("replicate")) else {
                    return Err(PipelineError::Layout(
                        "RNA pattern needs `condition` and `replicate` groups".into(),
                    ));
                };
                let channel = ReplicateChannel {
                    replicate: replicate.as_str().to_string(),
                    column: column.to_string(),
                };
                match conditions.iter_mut().find(|c| c.name == condition.as_str()) {
                    Some(existing) => existing.rna_channels.push(channel),
                    None => conditions.push(ConditionLayout {
                        name: condition.as_str().to_string(),
                        dna_channels: Vec::new(),
                        rna_channels: vec![channel],
                    }),
                }
                debug!("RNA channel {} -> {}", column, condition.as_str());
            } else if let Some(caps) = dna_re.captures(column) {
                match caps.name("condition") {
                    Some(condition) => bound_dna.push((condition.as_str().to_string(), column.to_string())),
                    None => shared_dna.push(column.to_string()),
                }
                debug!("DNA channel {}", column);
            }
        }

        for (condition, column) in bound_dna {
            let target = conditions
                .iter_mut()
                .find(|c| c.name == condition)
                .ok_or_else(|| {
                    PipelineError::Layout(format!(
                        "DNA column `{column}` names condition `{condition}` with no RNA channels"
                    ))
                })?;
            target.dna_channels.push(column);
        }
        for condition in conditions.iter_mut() {
            if condition.dna_channels.is_empty() {
                condition.dna_channels = shared_dna.clone();
            }
        }

        AssayLayout::new(conditions)
    }
}
