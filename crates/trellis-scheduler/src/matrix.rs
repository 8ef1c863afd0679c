//! Strategy expansion for matrix and loop parallelism.
//!
//! Expands a declared stage or step into concrete sibling instances.
//! Axis declaration order, then value declaration order within an
//! axis, is the only total order guaranteed; it determines instance
//! id suffixes like `-linux-amd64`.

use std::collections::HashMap;

use trellis_core::document::{Stage, Step};
use trellis_core::interpolation::SubstitutionContext;
use trellis_core::strategy::{Loop, Matrix, Strategy};

/// One expanded instance: the concrete declaration plus the axis
/// values it was produced with.
#[derive(Debug, Clone)]
pub struct Expansion<T> {
    pub node: T,
    /// Axis values in declaration order; appended to the declared id.
    pub suffix: Vec<String>,
    pub matrix: HashMap<String, String>,
}

/// Expand a stage. A stage without a strategy expands to itself.
pub fn expand_stage(stage: &Stage) -> Vec<Expansion<Stage>> {
    let Some(strategy) = &stage.strategy else {
        return vec![Expansion {
            node: stage.clone(),
            suffix: Vec::new(),
            matrix: HashMap::new(),
        }];
    };

    combinations(strategy)
        .into_iter()
        .map(|(suffix, matrix)| {
            let mut instance = substitute_stage(stage, &matrix);
            instance.strategy = None;
            Expansion {
                node: instance,
                suffix,
                matrix,
            }
        })
        .collect()
}

/// Expand a step. A step without a strategy expands to itself.
pub fn expand_step(step: &Step) -> Vec<Expansion<Step>> {
    let Some(strategy) = &step.strategy else {
        return vec![Expansion {
            node: step.clone(),
            suffix: Vec::new(),
            matrix: HashMap::new(),
        }];
    };

    combinations(strategy)
        .into_iter()
        .map(|(suffix, matrix)| {
            let mut instance = substitute_step(step, &matrix);
            instance.strategy = None;
            Expansion {
                node: instance,
                suffix,
                matrix,
            }
        })
        .collect()
}

/// Generate the concrete axis-value combinations for a strategy.
///
/// An axis with zero values produces zero combinations; the declared
/// node then materializes no instances at all. This is deliberate —
/// dependents that rely solely on it are skipped downstream, never
/// silently attached to a phantom node.
fn combinations(strategy: &Strategy) -> Vec<(Vec<String>, HashMap<String, String>)> {
    match strategy {
        Strategy::Matrix(matrix) => matrix_combinations(matrix),
        Strategy::Loop(looped) => loop_combinations(looped),
    }
}

fn matrix_combinations(matrix: &Matrix) -> Vec<(Vec<String>, HashMap<String, String>)> {
    if matrix.axes.is_empty() && matrix.include.is_empty() {
        return Vec::new();
    }

    let mut combos: Vec<Vec<String>> = vec![Vec::new()];
    for axis in &matrix.axes {
        let mut next = Vec::new();
        for combo in &combos {
            for value in &axis.values {
                let mut extended = combo.clone();
                extended.push(value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    // A zero-valued axis empties the product.
    if matrix.axes.iter().any(|axis| axis.values.is_empty()) {
        combos = Vec::new();
    }

    let mut result: Vec<(Vec<String>, HashMap<String, String>)> = combos
        .into_iter()
        .map(|values| {
            let map: HashMap<String, String> = matrix
                .axes
                .iter()
                .zip(values.iter())
                .map(|(axis, value)| (axis.name.clone(), value.clone()))
                .collect();
            (values, map)
        })
        .filter(|(_, map)| !excluded(map, &matrix.exclude))
        .collect();

    // Includes append combinations not already present.
    for include in &matrix.include {
        if result.iter().any(|(_, existing)| existing == include) {
            continue;
        }
        let mut suffix: Vec<String> = matrix
            .axes
            .iter()
            .filter_map(|axis| include.get(&axis.name).cloned())
            .collect();
        let mut extra_keys: Vec<&String> = include
            .keys()
            .filter(|k| !matrix.axes.iter().any(|axis| &axis.name == *k))
            .collect();
        extra_keys.sort();
        suffix.extend(extra_keys.iter().map(|k| include[*k].clone()));
        result.push((suffix, include.clone()));
    }

    result
}

/// An exclude entry matches when every listed key/value pair matches.
fn excluded(combo: &HashMap<String, String>, excludes: &[HashMap<String, String>]) -> bool {
    excludes.iter().any(|exclude| {
        !exclude.is_empty()
            && exclude
                .iter()
                .all(|(key, value)| combo.get(key) == Some(value))
    })
}

fn loop_combinations(looped: &Loop) -> Vec<(Vec<String>, HashMap<String, String>)> {
    looped
        .items
        .iter()
        .map(|item| {
            let mut map = HashMap::new();
            map.insert("item".to_string(), item.clone());
            (vec![item.clone()], map)
        })
        .collect()
}

fn substitute_stage(stage: &Stage, matrix: &HashMap<String, String>) -> Stage {
    substitute(stage, matrix)
}

fn substitute_step(step: &Step, matrix: &HashMap<String, String>) -> Step {
    substitute(step, matrix)
}

/// Substitute `${{ matrix.* }}` placeholders into every string field
/// of the declaration.
fn substitute<T: serde::Serialize + serde::de::DeserializeOwned + Clone>(
    node: &T,
    matrix: &HashMap<String, String>,
) -> T {
    if matrix.is_empty() {
        return node.clone();
    }
    let mut ctx = SubstitutionContext::new();
    ctx.matrix = matrix.clone();

    let Ok(mut value) = serde_json::to_value(node) else {
        return node.clone();
    };
    substitute_value(&mut value, &ctx);
    serde_json::from_value(value).unwrap_or_else(|_| node.clone())
}

fn substitute_value(value: &mut serde_json::Value, ctx: &SubstitutionContext) {
    match value {
        serde_json::Value::String(s) => *s = ctx.substitute(s),
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_value(item, ctx);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, ctx);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::document::StepPayload;
    use trellis_core::strategy::MatrixAxis;

    fn matrix_step(axes: Vec<MatrixAxis>) -> Step {
        let mut step = Step::from_script("build ${{ matrix.os }}/${{ matrix.arch }}");
        step.id = Some("build".to_string());
        step.strategy = Some(Strategy::matrix(axes));
        step
    }

    #[test]
    fn test_cartesian_product_count_and_order() {
        let step = matrix_step(vec![
            MatrixAxis::new("os", &["linux", "windows"]),
            MatrixAxis::new("arch", &["amd64", "arm64"]),
        ]);

        let instances = expand_step(&step);
        assert_eq!(instances.len(), 4);

        let suffixes: Vec<String> = instances.iter().map(|i| i.suffix.join("-")).collect();
        assert_eq!(
            suffixes,
            vec![
                "linux-amd64",
                "linux-arm64",
                "windows-amd64",
                "windows-arm64"
            ]
        );
    }

    #[test]
    fn test_axis_values_substituted() {
        let step = matrix_step(vec![
            MatrixAxis::new("os", &["linux"]),
            MatrixAxis::new("arch", &["amd64"]),
        ]);

        let instances = expand_step(&step);
        let StepPayload::Run(run) = &instances[0].node.payload else {
            panic!("expected run step");
        };
        assert_eq!(run.script, "build linux/amd64");
    }

    #[test]
    fn test_zero_valued_axis_expands_to_nothing() {
        let step = matrix_step(vec![
            MatrixAxis::new("os", &["linux", "windows"]),
            MatrixAxis::new("arch", &[]),
        ]);
        assert!(expand_step(&step).is_empty());
    }

    #[test]
    fn test_exclude_removes_combination() {
        let mut step = matrix_step(vec![
            MatrixAxis::new("os", &["linux", "macos"]),
            MatrixAxis::new("arch", &["amd64", "arm64"]),
        ]);
        if let Some(Strategy::Matrix(matrix)) = &mut step.strategy {
            let mut exclude = HashMap::new();
            exclude.insert("os".to_string(), "macos".to_string());
            exclude.insert("arch".to_string(), "amd64".to_string());
            matrix.exclude.push(exclude);
        }

        let instances = expand_step(&step);
        assert_eq!(instances.len(), 3);
        assert!(!instances.iter().any(|i| i.suffix == vec!["macos", "amd64"]));
    }

    #[test]
    fn test_include_appends_combination() {
        let mut step = matrix_step(vec![MatrixAxis::new("os", &["linux"])]);
        if let Some(Strategy::Matrix(matrix)) = &mut step.strategy {
            let mut include = HashMap::new();
            include.insert("os".to_string(), "freebsd".to_string());
            matrix.include.push(include);
        }

        let instances = expand_step(&step);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].suffix, vec!["freebsd"]);
    }

    #[test]
    fn test_no_strategy_expands_to_self() {
        let step = Step::from_script("echo hi");
        let instances = expand_step(&step);
        assert_eq!(instances.len(), 1);
        assert!(instances[0].suffix.is_empty());
    }

    #[test]
    fn test_loop_strategy() {
        let mut step = Step::from_script("deploy ${{ matrix.item }}");
        step.strategy = Some(Strategy::Loop(Loop {
            items: vec!["us-east".to_string(), "eu-west".to_string()],
        }));

        let instances = expand_step(&step);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].suffix, vec!["us-east"]);
        let StepPayload::Run(run) = &instances[1].node.payload else {
            panic!("expected run step");
        };
        assert_eq!(run.script, "deploy eu-west");
    }

    #[test]
    fn test_distinct_deterministic_ids() {
        let step = matrix_step(vec![
            MatrixAxis::new("os", &["linux", "windows"]),
            MatrixAxis::new("rust", &["stable", "beta", "nightly"]),
        ]);

        let first = expand_step(&step);
        let second = expand_step(&step);
        assert_eq!(first.len(), 6);

        let suffixes: Vec<_> = first.iter().map(|i| i.suffix.clone()).collect();
        let mut deduped = suffixes.clone();
        deduped.dedup();
        assert_eq!(suffixes.len(), deduped.len());
        assert_eq!(
            suffixes,
            second.iter().map(|i| i.suffix.clone()).collect::<Vec<_>>()
        );
    }
}
