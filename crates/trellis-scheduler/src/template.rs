//! Template resolution.
//!
//! Inlines stage and step template references (`uses` + `with`) into
//! concrete trees before strategy expansion and graph building, so
//! every downstream component operates on a uniform, template-free
//! representation. Resolution is a pure function of the node and the
//! template store.

use std::collections::HashMap;

use trellis_core::document::{
    Pipeline, Stage, StagePayload, Step, StepPayload, Template, TemplateBody, TemplateRef,
};
use trellis_core::error::{NodePath, ResolutionError};
use trellis_core::interpolation::{referenced_inputs, SubstitutionContext};
use trellis_core::ports::TemplateStore;

/// Resolve every template reference in a pipeline.
pub fn resolve_pipeline(
    pipeline: &Pipeline,
    store: &dyn TemplateStore,
) -> Result<Pipeline, ResolutionError> {
    let mut resolved = pipeline.clone();
    let path = NodePath::default();
    let mut stack = Vec::new();
    resolved.stages = pipeline
        .stages
        .iter()
        .map(|stage| resolve_stage(stage, store, &path, &mut stack))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(resolved)
}

fn resolve_stage(
    stage: &Stage,
    store: &dyn TemplateStore,
    path: &NodePath,
    stack: &mut Vec<String>,
) -> Result<Stage, ResolutionError> {
    let path = path.push(stage_label(stage));

    match &stage.payload {
        StagePayload::Template(reference) => {
            let template = lookup(store, reference, &path, stack)?;
            let body = match &template.body {
                TemplateBody::Stage(body) => body.as_ref().clone(),
                TemplateBody::Step(_) => {
                    return Err(ResolutionError::TemplateNotFound {
                        name: reference.uses.clone(),
                        chain: path.clone(),
                    });
                }
            };

            let substituted = substitute_stage(&body, &template, reference, &path)?;
            stack.push(reference.uses.clone());
            let mut resolved = resolve_stage(&substituted, store, &path, stack)?;
            stack.pop();

            // The referencing stage's own attributes win over the
            // template body's.
            if stage.id.is_some() {
                resolved.id = stage.id.clone();
            }
            if stage.name.is_some() {
                resolved.name = stage.name.clone();
            }
            if stage.if_expr.is_some() {
                resolved.if_expr = stage.if_expr.clone();
            }
            if stage.strategy.is_some() {
                resolved.strategy = stage.strategy.clone();
            }
            if stage.failure_strategy.is_some() {
                resolved.failure_strategy = stage.failure_strategy.clone();
            }
            if stage.timeout_seconds.is_some() {
                resolved.timeout_seconds = stage.timeout_seconds;
            }
            Ok(resolved)
        }
        StagePayload::Steps(steps) => {
            let mut resolved = stage.clone();
            resolved.payload = StagePayload::Steps(
                steps
                    .iter()
                    .map(|step| resolve_step(step, store, &path, stack))
                    .collect::<Result<Vec<_>, _>>()?,
            );
            Ok(resolved)
        }
        StagePayload::Group(group) => {
            let mut resolved_group = group.clone();
            resolved_group.stages = group
                .stages
                .iter()
                .map(|child| resolve_stage(child, store, &path, stack))
                .collect::<Result<Vec<_>, _>>()?;
            let mut resolved = stage.clone();
            resolved.payload = StagePayload::Group(resolved_group);
            Ok(resolved)
        }
        StagePayload::Parallel(group) => {
            let mut resolved_group = group.clone();
            resolved_group.stages = group
                .stages
                .iter()
                .map(|child| resolve_stage(child, store, &path, stack))
                .collect::<Result<Vec<_>, _>>()?;
            let mut resolved = stage.clone();
            resolved.payload = StagePayload::Parallel(resolved_group);
            Ok(resolved)
        }
    }
}

fn resolve_step(
    step: &Step,
    store: &dyn TemplateStore,
    path: &NodePath,
    stack: &mut Vec<String>,
) -> Result<Step, ResolutionError> {
    let path = path.push(step_label(step));

    match &step.payload {
        StepPayload::Template(reference) => {
            let template = lookup(store, reference, &path, stack)?;
            let body = match &template.body {
                TemplateBody::Step(body) => body.as_ref().clone(),
                TemplateBody::Stage(_) => {
                    return Err(ResolutionError::TemplateNotFound {
                        name: reference.uses.clone(),
                        chain: path.clone(),
                    });
                }
            };

            let substituted = substitute_step(&body, &template, reference, &path)?;
            stack.push(reference.uses.clone());
            let mut resolved = resolve_step(&substituted, store, &path, stack)?;
            stack.pop();

            if step.id.is_some() {
                resolved.id = step.id.clone();
            }
            if step.name.is_some() {
                resolved.name = step.name.clone();
            }
            if step.if_expr.is_some() {
                resolved.if_expr = step.if_expr.clone();
            }
            if !step.needs.is_empty() {
                resolved.needs = step.needs.clone();
            }
            if step.strategy.is_some() {
                resolved.strategy = step.strategy.clone();
            }
            if step.on_failure.is_some() {
                resolved.on_failure = step.on_failure.clone();
            }
            if step.timeout_seconds.is_some() {
                resolved.timeout_seconds = step.timeout_seconds;
            }
            resolved.disabled = step.disabled || resolved.disabled;
            Ok(resolved)
        }
        StepPayload::Group(group) | StepPayload::Parallel(group) => {
            let mut resolved_group = group.clone();
            resolved_group.steps = group
                .steps
                .iter()
                .map(|child| resolve_step(child, store, &path, stack))
                .collect::<Result<Vec<_>, _>>()?;
            let mut resolved = step.clone();
            resolved.payload = match &step.payload {
                StepPayload::Group(_) => StepPayload::Group(resolved_group),
                _ => StepPayload::Parallel(resolved_group),
            };
            Ok(resolved)
        }
        _ => Ok(step.clone()),
    }
}

fn lookup(
    store: &dyn TemplateStore,
    reference: &TemplateRef,
    path: &NodePath,
    stack: &[String],
) -> Result<Template, ResolutionError> {
    if stack.contains(&reference.uses) {
        let mut chain = stack.to_vec();
        chain.push(reference.uses.clone());
        return Err(ResolutionError::CyclicTemplate { chain });
    }
    store
        .get(&reference.uses)
        .ok_or_else(|| ResolutionError::TemplateNotFound {
            name: reference.uses.clone(),
            chain: path.clone(),
        })
}

fn substitute_stage(
    body: &Stage,
    template: &Template,
    reference: &TemplateRef,
    path: &NodePath,
) -> Result<Stage, ResolutionError> {
    let ctx = build_context(template, reference);
    let mut value = serde_json::to_value(body).map_err(|_| ResolutionError::TemplateNotFound {
        name: template.name.clone(),
        chain: path.clone(),
    })?;
    substitute_value(&mut value, &ctx, template, path)?;
    serde_json::from_value(value).map_err(|_| ResolutionError::TemplateNotFound {
        name: template.name.clone(),
        chain: path.clone(),
    })
}

fn substitute_step(
    body: &Step,
    template: &Template,
    reference: &TemplateRef,
    path: &NodePath,
) -> Result<Step, ResolutionError> {
    let ctx = build_context(template, reference);
    let mut value = serde_json::to_value(body).map_err(|_| ResolutionError::TemplateNotFound {
        name: template.name.clone(),
        chain: path.clone(),
    })?;
    substitute_value(&mut value, &ctx, template, path)?;
    serde_json::from_value(value).map_err(|_| ResolutionError::TemplateNotFound {
        name: template.name.clone(),
        chain: path.clone(),
    })
}

fn build_context(template: &Template, reference: &TemplateRef) -> SubstitutionContext {
    let mut ctx = SubstitutionContext::new();
    for (name, default) in &template.inputs {
        if let Some(default) = default {
            ctx.inputs.insert(name.clone(), default.clone());
        }
    }
    for (name, value) in &reference.with {
        ctx.inputs.insert(name.clone(), value_to_string(value));
    }
    ctx
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walk every string field of the body, rejecting parameters that are
/// referenced but not supplied, then substituting the rest.
fn substitute_value(
    value: &mut serde_json::Value,
    ctx: &SubstitutionContext,
    template: &Template,
    path: &NodePath,
) -> Result<(), ResolutionError> {
    match value {
        serde_json::Value::String(s) => {
            for parameter in referenced_inputs(s) {
                if !ctx.inputs.contains_key(&parameter) {
                    return Err(ResolutionError::MissingParameter {
                        template: template.name.clone(),
                        parameter,
                        chain: path.clone(),
                    });
                }
            }
            *s = ctx.substitute(s);
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_value(item, ctx, template, path)?;
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, ctx, template, path)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn stage_label(stage: &Stage) -> String {
    stage
        .id
        .clone()
        .or_else(|| stage.name.clone())
        .unwrap_or_else(|| "<stage>".to_string())
}

fn step_label(step: &Step) -> String {
    step.id
        .clone()
        .or_else(|| step.name.clone())
        .unwrap_or_else(|| "<step>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use trellis_core::document::{StepRun, TemplateRef};
    use trellis_core::interpolation::has_placeholder;
    use trellis_core::ports::InMemoryTemplateStore;

    fn template_step(name: &str, script: &str) -> Template {
        Template {
            name: name.to_string(),
            inputs: HashMap::new(),
            body: TemplateBody::Step(Box::new(Step::from_script(script))),
        }
    }

    fn template_ref_step(uses: &str, with: &[(&str, &str)]) -> Step {
        let mut step = Step::from_script("");
        step.payload = StepPayload::Template(TemplateRef {
            uses: uses.to_string(),
            with: with
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect(),
        });
        step
    }

    fn pipeline_with_step(step: Step) -> Pipeline {
        Pipeline {
            id: None,
            name: "test".to_string(),
            env: HashMap::new(),
            concurrency: None,
            stages: vec![Stage {
                id: Some("main".to_string()),
                name: None,
                if_expr: None,
                strategy: None,
                failure_strategy: None,
                timeout_seconds: None,
                payload: StagePayload::Steps(vec![step]),
            }],
            timeout_seconds: None,
        }
    }

    #[test]
    fn test_resolves_template_reference() {
        let mut store = InMemoryTemplateStore::new();
        let mut template = template_step("lint", "cargo clippy -- -D ${{ inputs.lints }}");
        template
            .inputs
            .insert("lints".to_string(), Some("warnings".to_string()));
        store.insert(template);

        let pipeline = pipeline_with_step(template_ref_step("lint", &[]));
        let resolved = resolve_pipeline(&pipeline, &store).unwrap();

        let StagePayload::Steps(steps) = &resolved.stages[0].payload else {
            panic!("expected steps");
        };
        let StepPayload::Run(run) = &steps[0].payload else {
            panic!("expected run step");
        };
        assert_eq!(run.script, "cargo clippy -- -D warnings");
    }

    #[test]
    fn test_with_overrides_default() {
        let mut store = InMemoryTemplateStore::new();
        let mut template = template_step("build", "make ${{ inputs.target }}");
        template
            .inputs
            .insert("target".to_string(), Some("all".to_string()));
        store.insert(template);

        let pipeline = pipeline_with_step(template_ref_step("build", &[("target", "release")]));
        let resolved = resolve_pipeline(&pipeline, &store).unwrap();

        let StagePayload::Steps(steps) = &resolved.stages[0].payload else {
            panic!("expected steps");
        };
        let StepPayload::Run(run) = &steps[0].payload else {
            panic!("expected run step");
        };
        assert_eq!(run.script, "make release");
    }

    #[test]
    fn test_unknown_template_rejected() {
        let store = InMemoryTemplateStore::new();
        let pipeline = pipeline_with_step(template_ref_step("missing", &[]));
        let err = resolve_pipeline(&pipeline, &store).unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::TemplateNotFound { name, .. } if name == "missing"
        ));
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let mut store = InMemoryTemplateStore::new();
        store.insert(template_step("deploy", "deploy ${{ inputs.env }}"));

        let pipeline = pipeline_with_step(template_ref_step("deploy", &[]));
        let err = resolve_pipeline(&pipeline, &store).unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::MissingParameter { parameter, .. } if parameter == "env"
        ));
    }

    #[test]
    fn test_cyclic_template_reports_chain() {
        let mut store = InMemoryTemplateStore::new();
        store.insert(Template {
            name: "a".to_string(),
            inputs: HashMap::new(),
            body: TemplateBody::Step(Box::new(template_ref_step("b", &[]))),
        });
        store.insert(Template {
            name: "b".to_string(),
            inputs: HashMap::new(),
            body: TemplateBody::Step(Box::new(template_ref_step("a", &[]))),
        });

        let pipeline = pipeline_with_step(template_ref_step("a", &[]));
        let err = resolve_pipeline(&pipeline, &store).unwrap_err();
        match err {
            ResolutionError::CyclicTemplate { chain } => {
                assert_eq!(chain, vec!["a", "b", "a"]);
            }
            other => panic!("expected cyclic template error, got {other:?}"),
        }
    }

    #[test]
    fn test_output_contains_no_residual_reference() {
        let mut store = InMemoryTemplateStore::new();
        store.insert(Template {
            name: "outer".to_string(),
            inputs: HashMap::new(),
            body: TemplateBody::Step(Box::new(template_ref_step("inner", &[("cmd", "ls")]))),
        });
        let mut inner = template_step("inner", "${{ inputs.cmd }}");
        inner.inputs.insert("cmd".to_string(), None);
        store.insert(inner);

        let pipeline = pipeline_with_step(template_ref_step("outer", &[]));
        let resolved = resolve_pipeline(&pipeline, &store).unwrap();

        let json = serde_json::to_string(&resolved).unwrap();
        assert!(!json.contains("template"), "residual template reference");
        assert!(!has_placeholder(&json), "residual placeholder");
    }

    #[test]
    fn test_reference_attributes_override_body() {
        let mut store = InMemoryTemplateStore::new();
        let mut body = Step::from_script("echo hi");
        body.id = Some("from-template".to_string());
        store.insert(Template {
            name: "greet".to_string(),
            inputs: HashMap::new(),
            body: TemplateBody::Step(Box::new(body)),
        });

        let mut reference = template_ref_step("greet", &[]);
        reference.id = Some("my-greeting".to_string());
        reference.needs = vec!["setup".to_string()];

        let pipeline = Pipeline {
            id: None,
            name: "test".to_string(),
            env: HashMap::new(),
            concurrency: None,
            stages: vec![Stage {
                id: Some("main".to_string()),
                name: None,
                if_expr: None,
                strategy: None,
                failure_strategy: None,
                timeout_seconds: None,
                payload: StagePayload::Steps(vec![
                    Step {
                        id: Some("setup".to_string()),
                        ..Step::from_script("true")
                    },
                    reference,
                ]),
            }],
            timeout_seconds: None,
        };

        let resolved = resolve_pipeline(&pipeline, &store).unwrap();
        let StagePayload::Steps(steps) = &resolved.stages[0].payload else {
            panic!("expected steps");
        };
        assert_eq!(steps[1].id.as_deref(), Some("my-greeting"));
        assert_eq!(steps[1].needs, vec!["setup".to_string()]);
        assert!(matches!(&steps[1].payload, StepPayload::Run(StepRun { script, .. }) if script == "echo hi"));
    }
}
