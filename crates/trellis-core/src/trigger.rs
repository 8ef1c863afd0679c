//! Platform events and agent trigger declarations.
//!
//! Agents declare the events they respond to in an `on` block. The
//! trigger matcher compares inbound platform events against these
//! declarations; filter fields AND together, list values within a
//! single field OR together.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One entry of an agent's `on` declaration: an event family plus its
/// optional filter.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSpec {
    // SCM events
    Push(PushFilter),
    PullRequest(PullRequestFilter),
    Schedule,
    WorkflowDispatch,

    // CI events
    PipelineFailed(PipelineFilter),
    BuildFailed(PipelineFilter),
    TestFailed(PipelineFilter),

    // CD events
    Deploy(DeployFilter),
    DeployFailed(DeployFilter),
    Canary(DeployFilter),
    Rollback(DeployFilter),
    SloBreach(SloFilter),
    PostDeploy(DeployFilter),

    // Cost events
    CostSpike(CostFilter),
    BudgetExceeded(BudgetFilter),
    CostAnomaly(CostFilter),

    // Security events
    VulnerabilityFound(VulnerabilityFilter),
    ScanComplete(ScanFilter),
    SeverityThreshold(VulnerabilityFilter),

    // Platform events
    CommentMention(CommentMentionFilter),
    RepoCreated(RepoFilter),
    FlagStale,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PushFilter {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(rename = "branches-ignore", default)]
    pub branches_ignore: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(rename = "paths-ignore", default)]
    pub paths_ignore: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PullRequestFilter {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(rename = "branches-ignore", default)]
    pub branches_ignore: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(rename = "paths-ignore", default)]
    pub paths_ignore: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PipelineFilter {
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub pipelines: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DeployFilter {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub environments: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SloFilter {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub slos: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CostFilter {
    #[serde(default)]
    pub resources: Vec<String>,
    /// Minimum percentage change for the event to match.
    #[serde(rename = "threshold-percent", default)]
    pub threshold_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BudgetFilter {
    #[serde(default)]
    pub budgets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct VulnerabilityFilter {
    #[serde(default)]
    pub repos: Vec<String>,
    /// Severities that match; empty matches all.
    #[serde(default)]
    pub severity: Vec<Severity>,
    #[serde(rename = "scan-types", default)]
    pub scan_types: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ScanFilter {
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(rename = "scan-types", default)]
    pub scan_types: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CommentMentionFilter {
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub repos: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RepoFilter {
    #[serde(default)]
    pub repos: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// An inbound platform event, supplied by the external event-delivery
/// mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEvent {
    Push {
        branch: String,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        paths_changed: Vec<String>,
    },
    PullRequest {
        target_branch: String,
        action: String,
        #[serde(default)]
        paths_changed: Vec<String>,
    },
    Schedule {
        cron: String,
    },
    WorkflowDispatch {
        #[serde(default)]
        actor: Option<String>,
    },
    PipelineFailed {
        repo: String,
        branch: String,
        pipeline: String,
    },
    BuildFailed {
        repo: String,
        branch: String,
        pipeline: String,
    },
    TestFailed {
        repo: String,
        branch: String,
        pipeline: String,
    },
    Deploy {
        service: String,
        environment: String,
    },
    DeployFailed {
        service: String,
        environment: String,
    },
    Canary {
        service: String,
        environment: String,
    },
    Rollback {
        service: String,
        environment: String,
    },
    SloBreach {
        service: String,
        slo: String,
    },
    PostDeploy {
        service: String,
        environment: String,
    },
    CostSpike {
        resource: String,
        percent: f64,
    },
    BudgetExceeded {
        budget: String,
    },
    CostAnomaly {
        resource: String,
        percent: f64,
    },
    VulnerabilityFound {
        repo: String,
        severity: Severity,
        scan_type: String,
    },
    ScanComplete {
        repo: String,
        scan_type: String,
    },
    SeverityThreshold {
        repo: String,
        severity: Severity,
        scan_type: String,
    },
    CommentMention {
        agent: String,
        repo: String,
    },
    RepoCreated {
        repo: String,
    },
    FlagStale {
        flag: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_platform_event_tagged_serialization() {
        let event = PlatformEvent::Deploy {
            service: "api".to_string(),
            environment: "prod".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deploy");
        assert_eq!(json["service"], "api");
    }
}
