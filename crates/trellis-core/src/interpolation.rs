use regex::Regex;
use std::collections::HashMap;

/// Context for placeholder substitution.
///
/// Supports:
/// - `${{ inputs.name }}` - template parameter
/// - `${{ matrix.key }}` - matrix axis value
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Template parameters supplied via `with` (plus defaults).
    pub inputs: HashMap<String, String>,
    /// Matrix axis values for the current instance.
    pub matrix: HashMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitute placeholders in a string. Unresolvable placeholders
    /// are left untouched so the resolver can detect missing
    /// parameters.
    pub fn substitute(&self, input: &str) -> String {
        let re = placeholder_regex();
        re.replace_all(input, |caps: &regex::Captures| {
            let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
            self.resolve(expr)
                .unwrap_or_else(|| caps.get(0).map_or("", |m| m.as_str()).to_string())
        })
        .to_string()
    }

    fn resolve(&self, expr: &str) -> Option<String> {
        if let Some(name) = expr.strip_prefix("inputs.") {
            return self.inputs.get(name).cloned();
        }
        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned();
        }
        None
    }
}

fn placeholder_regex() -> Regex {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("placeholder regex")
}

/// Collect the `inputs.*` parameter names referenced in a string.
pub fn referenced_inputs(input: &str) -> Vec<String> {
    let re = placeholder_regex();
    re.captures_iter(input)
        .filter_map(|caps| {
            caps.get(1)
                .map(|m| m.as_str().trim())
                .and_then(|expr| expr.strip_prefix("inputs."))
                .map(|name| name.to_string())
        })
        .collect()
}

/// Whether a string still carries any placeholder.
pub fn has_placeholder(input: &str) -> bool {
    placeholder_regex().is_match(input)
}
