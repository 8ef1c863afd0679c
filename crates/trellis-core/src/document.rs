//! Typed pipeline and agent document definitions.
//!
//! These types are what the external deserializer/validator produces
//! from the user-authored YAML. The engine consumes them as-is; field
//! level validation (enums, formats) happens upstream.

use crate::failure::FailureStrategy;
use crate::strategy::Strategy;
use crate::trigger::TriggerSpec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level document: a pipeline, or an agent (a pipeline that runs
/// in response to platform events).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Document {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub pipeline: Option<Pipeline>,
    #[serde(default)]
    pub agent: Option<Agent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub concurrency: Option<Concurrency>,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// An agent is a pipeline with an `on` declaration plus AI-specific
/// configuration. The trigger matcher decides, per inbound platform
/// event, whether a run starts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Agent {
    pub name: String,
    pub on: Vec<TriggerSpec>,
    #[serde(flatten)]
    pub pipeline: Pipeline,
    #[serde(default)]
    pub tools: HashMap<String, ToolDeclaration>,
    #[serde(default)]
    pub rules: Option<RuleSet>,
}

/// A tool or connector available to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolDeclaration {
    #[serde(rename = "type", default)]
    pub tool_type: Option<ToolType>,
    #[serde(default)]
    pub oneof: Vec<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Connector,
    Mcp,
    Builtin,
}

/// Behavioral rules for an agent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuleSet {
    #[serde(rename = "type", default)]
    pub rule_type: Option<String>,
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub any: Vec<String>,
}

/// Concurrency groups limit concurrent execution of runs that share
/// the same key.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Concurrency {
    pub group: String,
    #[serde(default)]
    pub cancel_in_progress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Stage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "if", default)]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(rename = "failure-strategy", default)]
    pub failure_strategy: Option<FailureStrategy>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(flatten)]
    pub payload: StagePayload,
}

/// Exactly one payload per stage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StagePayload {
    /// A list of steps executed within this stage.
    Steps(Vec<Step>),
    /// A group of stages executed in listed order.
    Group(StageGroup),
    /// A group of stages with no implicit inter-child ordering.
    Parallel(StageGroup),
    /// A reference to a stage template.
    Template(TemplateRef),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageGroup {
    /// Maximum number of child stages running simultaneously. Unset
    /// or zero means unbounded for `parallel`, sequential for `group`.
    #[serde(default)]
    pub parallel: Option<u32>,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "if", default)]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Steps that must reach a terminal state before this step can
    /// run. Empty means only the positional predecessor applies.
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(rename = "on-failure", default)]
    pub on_failure: Option<FailureStrategy>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(flatten)]
    pub payload: StepPayload,
}

/// Exactly one payload per step. The schema's polymorphic step maps
/// to this tagged variant; dispatch on kind replaces any
/// dynamic-typing check.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepPayload {
    Run(StepRun),
    RunTest(StepTest),
    Action(StepAction),
    Approval(StepApproval),
    /// A run step dispatched fire-and-forget; it never gates
    /// dependents or run completion.
    Background(StepRun),
    Barrier(StepBarrier),
    Clone(StepClone),
    Group(StepGroup),
    Parallel(StepGroup),
    Queue(StepQueue),
    Template(TemplateRef),
    Agent(StepAgent),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StepRun {
    #[serde(default)]
    pub shell: Option<Shell>,
    pub script: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Shell {
    Sh,
    Bash,
    Powershell,
    Pwsh,
    Python,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepTest {
    #[serde(default)]
    pub shell: Option<Shell>,
    pub script: String,
    /// Unit test matching logic in glob format.
    #[serde(rename = "match", default)]
    pub match_globs: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepAction {
    pub uses: String,
    #[serde(default)]
    pub with: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepApproval {
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub with: HashMap<String, serde_json::Value>,
}

/// A named rendezvous point synchronizing parallel branches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepBarrier {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepClone {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "ref", default)]
    pub clone_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepGroup {
    /// Maximum number of child steps running simultaneously within
    /// this container. Extra ready children wait in declaration order.
    #[serde(default)]
    pub parallel: Option<u32>,
    pub steps: Vec<Step>,
}

/// Serializes past occurrences on a key within the declared scope.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepQueue {
    pub key: String,
    #[serde(default)]
    pub scope: QueueScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueueScope {
    /// Unique key space per whole run.
    #[default]
    Pipeline,
    /// Unique key space per enclosing stage.
    Stage,
}

/// A reference to a stage or step template, resolved before
/// expansion and graph building.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TemplateRef {
    pub uses: String,
    #[serde(default)]
    pub with: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepAgent {
    pub uses: String,
    #[serde(default)]
    pub with: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub task: Option<String>,
}

/// A reusable stage or step body looked up by name through the
/// template store.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Template {
    pub name: String,
    /// Declared inputs with optional defaults. An input without a
    /// default must be supplied by the caller's `with`.
    #[serde(default)]
    pub inputs: HashMap<String, Option<String>>,
    #[serde(flatten)]
    pub body: TemplateBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TemplateBody {
    Stage(Box<Stage>),
    Step(Box<Step>),
}

impl Step {
    /// Normalize the schema's shorthand string form into a run step.
    pub fn from_script(script: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            if_expr: None,
            disabled: false,
            needs: Vec::new(),
            strategy: None,
            on_failure: None,
            timeout_seconds: None,
            env: HashMap::new(),
            payload: StepPayload::Run(StepRun {
                shell: None,
                script: script.into(),
                env: HashMap::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_step_shorthand_normalizes_to_run() {
        let step = Step::from_script("make test");
        match &step.payload {
            StepPayload::Run(run) => assert_eq!(run.script, "make test"),
            other => panic!("expected run payload, got {:?}", other),
        }
    }

    #[test]
    fn test_document_roundtrip() {
        let doc = Document {
            version: Some("1".to_string()),
            pipeline: Some(Pipeline {
                id: Some("build".to_string()),
                name: "build".to_string(),
                env: HashMap::new(),
                concurrency: Some(Concurrency {
                    group: "deploy-prod".to_string(),
                    cancel_in_progress: true,
                }),
                stages: vec![Stage {
                    id: Some("stage-1".to_string()),
                    name: None,
                    if_expr: None,
                    strategy: None,
                    failure_strategy: None,
                    timeout_seconds: None,
                    payload: StagePayload::Steps(vec![Step::from_script("echo hi")]),
                }],
                timeout_seconds: None,
            }),
            agent: None,
        };

        let json = serde_json::to_string(&doc).unwrap();
        let parsed: Document = serde_json::from_str(&json).unwrap();
        let pipeline = parsed.pipeline.unwrap();
        assert_eq!(pipeline.name, "build");
        assert_eq!(pipeline.concurrency.unwrap().group, "deploy-prod");
    }
}
