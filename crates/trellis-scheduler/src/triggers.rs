//! Trigger matching for agent `on` declarations.
//!
//! A pure predicate invoked once per inbound platform event per
//! agent. The event type must appear in the declared trigger set;
//! declared filter fields AND together, and list values within a
//! single field OR together.

use trellis_core::trigger::{
    BudgetFilter, CommentMentionFilter, CostFilter, DeployFilter, PipelineFilter, PlatformEvent,
    PullRequestFilter, PushFilter, RepoFilter, ScanFilter, Severity, SloFilter, TriggerSpec,
    VulnerabilityFilter,
};

/// Matcher for deciding whether an event starts an agent run.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check whether any declared trigger accepts the event.
    pub fn matches(&self, on: &[TriggerSpec], event: &PlatformEvent) -> bool {
        on.iter().any(|spec| self.spec_matches(spec, event))
    }

    fn spec_matches(&self, spec: &TriggerSpec, event: &PlatformEvent) -> bool {
        match (spec, event) {
            (
                TriggerSpec::Push(filter),
                PlatformEvent::Push {
                    branch,
                    tag,
                    paths_changed,
                },
            ) => self.push_matches(filter, branch, tag.as_deref(), paths_changed),
            (
                TriggerSpec::PullRequest(filter),
                PlatformEvent::PullRequest {
                    target_branch,
                    action,
                    paths_changed,
                },
            ) => self.pull_request_matches(filter, target_branch, action, paths_changed),
            (TriggerSpec::Schedule, PlatformEvent::Schedule { .. }) => true,
            (TriggerSpec::WorkflowDispatch, PlatformEvent::WorkflowDispatch { .. }) => true,
            (
                TriggerSpec::PipelineFailed(filter),
                PlatformEvent::PipelineFailed {
                    repo,
                    branch,
                    pipeline,
                },
            )
            | (
                TriggerSpec::BuildFailed(filter),
                PlatformEvent::BuildFailed {
                    repo,
                    branch,
                    pipeline,
                },
            )
            | (
                TriggerSpec::TestFailed(filter),
                PlatformEvent::TestFailed {
                    repo,
                    branch,
                    pipeline,
                },
            ) => self.pipeline_matches(filter, repo, branch, pipeline),
            (
                TriggerSpec::Deploy(filter),
                PlatformEvent::Deploy {
                    service,
                    environment,
                },
            )
            | (
                TriggerSpec::DeployFailed(filter),
                PlatformEvent::DeployFailed {
                    service,
                    environment,
                },
            )
            | (
                TriggerSpec::Canary(filter),
                PlatformEvent::Canary {
                    service,
                    environment,
                },
            )
            | (
                TriggerSpec::Rollback(filter),
                PlatformEvent::Rollback {
                    service,
                    environment,
                },
            )
            | (
                TriggerSpec::PostDeploy(filter),
                PlatformEvent::PostDeploy {
                    service,
                    environment,
                },
            ) => self.deploy_matches(filter, service, environment),
            (TriggerSpec::SloBreach(filter), PlatformEvent::SloBreach { service, slo }) => {
                self.slo_matches(filter, service, slo)
            }
            (TriggerSpec::CostSpike(filter), PlatformEvent::CostSpike { resource, percent })
            | (
                TriggerSpec::CostAnomaly(filter),
                PlatformEvent::CostAnomaly { resource, percent },
            ) => self.cost_matches(filter, resource, *percent),
            (TriggerSpec::BudgetExceeded(filter), PlatformEvent::BudgetExceeded { budget }) => {
                self.budget_matches(filter, budget)
            }
            (
                TriggerSpec::VulnerabilityFound(filter),
                PlatformEvent::VulnerabilityFound {
                    repo,
                    severity,
                    scan_type,
                },
            )
            | (
                TriggerSpec::SeverityThreshold(filter),
                PlatformEvent::SeverityThreshold {
                    repo,
                    severity,
                    scan_type,
                },
            ) => self.vulnerability_matches(filter, repo, *severity, scan_type),
            (TriggerSpec::ScanComplete(filter), PlatformEvent::ScanComplete { repo, scan_type }) => {
                self.scan_matches(filter, repo, scan_type)
            }
            (
                TriggerSpec::CommentMention(filter),
                PlatformEvent::CommentMention { agent, repo },
            ) => self.mention_matches(filter, agent, repo),
            (TriggerSpec::RepoCreated(filter), PlatformEvent::RepoCreated { repo }) => {
                self.repo_matches(filter, repo)
            }
            (TriggerSpec::FlagStale, PlatformEvent::FlagStale { .. }) => true,
            _ => false,
        }
    }

    fn push_matches(
        &self,
        filter: &PushFilter,
        branch: &str,
        tag: Option<&str>,
        paths_changed: &[String],
    ) -> bool {
        if let Some(tag) = tag {
            // Tag pushes only match when tag patterns are declared.
            return self.tag_matches(&filter.tags, tag);
        }
        self.branch_matches(&filter.branches, &filter.branches_ignore, branch)
            && self.paths_match(&filter.paths, &filter.paths_ignore, paths_changed)
    }

    fn pull_request_matches(
        &self,
        filter: &PullRequestFilter,
        target_branch: &str,
        action: &str,
        paths_changed: &[String],
    ) -> bool {
        self.branch_matches(&filter.branches, &filter.branches_ignore, target_branch)
            && self.paths_match(&filter.paths, &filter.paths_ignore, paths_changed)
            && list_matches(&filter.types, action)
    }

    fn pipeline_matches(
        &self,
        filter: &PipelineFilter,
        repo: &str,
        branch: &str,
        pipeline: &str,
    ) -> bool {
        glob_list_matches(&filter.repos, repo)
            && glob_list_matches(&filter.branches, branch)
            && glob_list_matches(&filter.pipelines, pipeline)
    }

    fn deploy_matches(&self, filter: &DeployFilter, service: &str, environment: &str) -> bool {
        glob_list_matches(&filter.services, service)
            && glob_list_matches(&filter.environments, environment)
    }

    fn slo_matches(&self, filter: &SloFilter, service: &str, slo: &str) -> bool {
        glob_list_matches(&filter.services, service) && glob_list_matches(&filter.slos, slo)
    }

    fn cost_matches(&self, filter: &CostFilter, resource: &str, percent: f64) -> bool {
        glob_list_matches(&filter.resources, resource)
            && filter
                .threshold_percent
                .is_none_or(|threshold| percent >= threshold)
    }

    fn budget_matches(&self, filter: &BudgetFilter, budget: &str) -> bool {
        glob_list_matches(&filter.budgets, budget)
    }

    fn vulnerability_matches(
        &self,
        filter: &VulnerabilityFilter,
        repo: &str,
        severity: Severity,
        scan_type: &str,
    ) -> bool {
        glob_list_matches(&filter.repos, repo)
            && (filter.severity.is_empty() || filter.severity.contains(&severity))
            && list_matches(&filter.scan_types, scan_type)
    }

    fn scan_matches(&self, filter: &ScanFilter, repo: &str, scan_type: &str) -> bool {
        glob_list_matches(&filter.repos, repo) && list_matches(&filter.scan_types, scan_type)
    }

    fn mention_matches(&self, filter: &CommentMentionFilter, agent: &str, repo: &str) -> bool {
        list_matches(&filter.agents, agent) && glob_list_matches(&filter.repos, repo)
    }

    fn repo_matches(&self, filter: &RepoFilter, repo: &str) -> bool {
        glob_list_matches(&filter.repos, repo)
    }

    fn branch_matches(&self, patterns: &[String], ignore: &[String], branch: &str) -> bool {
        let included = patterns.is_empty() || patterns.iter().any(|p| glob_match(p, branch));
        let ignored = ignore.iter().any(|p| glob_match(p, branch));
        included && !ignored
    }

    fn tag_matches(&self, patterns: &[String], tag: &str) -> bool {
        // Unlike branches, tags never match implicitly.
        !patterns.is_empty() && patterns.iter().any(|p| glob_match(p, tag))
    }

    fn paths_match(&self, include: &[String], exclude: &[String], changed: &[String]) -> bool {
        if include.is_empty() && exclude.is_empty() {
            return true;
        }

        let included = if include.is_empty() {
            true
        } else {
            changed
                .iter()
                .any(|path| include.iter().any(|p| glob_match(p, path)))
        };

        let excluded = !changed.is_empty()
            && changed
                .iter()
                .all(|path| exclude.iter().any(|p| glob_match(p, path)));

        included && !excluded
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn list_matches(values: &[String], value: &str) -> bool {
    values.is_empty() || values.iter().any(|v| v == value)
}

fn glob_list_matches(patterns: &[String], value: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| glob_match(p, value))
}

fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return text.starts_with(prefix);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix_slash = format!("{}/", prefix);
        if text.starts_with(&prefix_slash) {
            return !text[prefix_slash.len()..].contains('/');
        }
        return false;
    }
    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            return text.starts_with(parts[0]) && text.ends_with(parts[1]);
        }
    }
    pattern == text
}
