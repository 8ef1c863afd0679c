//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and its
//! external collaborators: the executor that runs a node's payload,
//! the event sink that consumes state changes, the condition
//! evaluator, and the template registry.

use crate::document::Template;
use crate::events::Event;
use crate::node::{ExecutionReport, Node};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Executes a node's payload and reports back exactly one terminal
/// status. Execution itself (shell, container, git clone, LLM call)
/// is entirely the adapter's concern.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, node: &Node) -> ExecutionReport;
}

/// Consumer of the engine's state-change event stream.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Evaluates a node's `if` expression against the run context.
///
/// The expression language itself is out of scope; the contract is
/// take a context, return a boolean.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &ConditionContext) -> bool;
}

/// Context handed to the condition evaluator.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    pub env: HashMap<String, String>,
    pub matrix: HashMap<String, String>,
}

/// Template registry keyed by template name.
pub trait TemplateStore: Send + Sync {
    fn get(&self, name: &str) -> Option<Template>;
}

/// Event sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Condition evaluator that treats every expression as true.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrueEvaluator;

impl ConditionEvaluator for TrueEvaluator {
    fn evaluate(&self, _expression: &str, _context: &ConditionContext) -> bool {
        true
    }
}

/// In-memory template store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTemplateStore {
    templates: HashMap<String, Template>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, template: Template) {
        self.templates.insert(template.name.clone(), template);
    }
}

impl TemplateStore for InMemoryTemplateStore {
    fn get(&self, name: &str) -> Option<Template> {
        self.templates.get(name).cloned()
    }
}
