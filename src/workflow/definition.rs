//! Workflow definition documents.
//!
//! A definition is `{id, context?, tasks: [...]}` where every task has the
//! shape of `Task`. JSON and TOML are both accepted.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{Condition, DependencyGraph, Task};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    /// Initial workflow context, visible to task conditions.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl WorkflowDefinition {
    pub fn new(id: &str, tasks: Vec<Task>) -> Self {
        Self {
            id: id.to_string(),
            context: Map::new(),
            tasks,
        }
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a file, picking the format from its extension (`.toml`,
    /// anything else is read as JSON).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Validate the definition and build its dependency graph.
    ///
    /// Fails on an empty id, duplicate or undefined task ids, cycles, and
    /// conditions that do not parse.
    pub fn plan(&self) -> Result<DependencyGraph> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("workflow id must not be empty".to_string()));
        }
        for task in &self.tasks {
            if task.id.as_str().trim().is_empty() {
                return Err(Error::Validation(format!(
                    "task of kind `{}` has an empty id",
                    task.kind
                )));
            }
        }
        self.conditions()?;
        DependencyGraph::from_tasks(self.tasks.iter().cloned())
    }

    /// Parsed conditions, in task order.
    pub fn conditions(&self) -> Result<Vec<(&Task, Condition)>> {
        self.tasks
            .iter()
            .filter_map(|task| task.condition.as_deref().map(|src| (task, src)))
            .map(|(task, src)| Ok((task, Condition::parse(src)?)))
            .collect()
    }
}
