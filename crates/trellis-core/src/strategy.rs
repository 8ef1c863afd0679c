//! Matrix and looping execution strategies.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Declarative expansion strategy producing multiple node instances
/// from one declaration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Matrix(Matrix),
    Loop(Loop),
}

/// A matrix strategy. Axis declaration order, then value declaration
/// order within an axis, is the only total order guaranteed; it
/// determines instance id suffixes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Matrix {
    pub axes: Vec<MatrixAxis>,
    /// Extra combinations appended after the cartesian product.
    #[serde(default)]
    pub include: Vec<HashMap<String, String>>,
    /// Combinations removed from the product. An exclude entry matches
    /// a combination when every listed key/value pair matches.
    #[serde(default)]
    pub exclude: Vec<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl MatrixAxis {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// A looping strategy over a single enumerable input.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Loop {
    pub items: Vec<String>,
}

impl Strategy {
    pub fn matrix(axes: Vec<MatrixAxis>) -> Self {
        Self::Matrix(Matrix {
            axes,
            include: Vec::new(),
            exclude: Vec::new(),
        })
    }
}
