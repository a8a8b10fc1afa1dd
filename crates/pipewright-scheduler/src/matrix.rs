//! Matrix expansion for parallel job generation.

use indexmap::IndexMap;
use pipewright_core::pipeline::JobDefinition;
use pipewright_core::run::MatrixAssignment;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("job {job}: matrix axis '{axis}' has no values")]
    EmptyAxis { job: String, axis: String },
    #[error("job {job}: exclude entry {index} is empty")]
    EmptyExclude { job: String, index: usize },
    #[error("job {job}: exclude entry {index} names undeclared axis '{axis}'")]
    UnknownExcludeAxis {
        job: String,
        index: usize,
        axis: String,
    },
    #[error("job {job}: include entry {index} is empty")]
    EmptyInclude { job: String, index: usize },
    #[error("job {job}: matrix expands to zero combinations")]
    NoCombinations { job: String },
}

impl From<MatrixError> for pipewright_core::Error {
    fn from(err: MatrixError) -> Self {
        pipewright_core::Error::Configuration(err.to_string())
    }
}

/// Result of matrix expansion.
#[derive(Debug, Clone)]
pub struct MatrixExpansion {
    pub template: String,
    /// Assignments in expansion order. A job without a matrix yields one
    /// empty assignment.
    pub assignments: Vec<MatrixAssignment>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
}

impl MatrixExpansion {
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a job's matrix: cross product in axis order, then excludes,
    /// then includes.
    pub fn expand(&self, job: &JobDefinition) -> Result<MatrixExpansion, MatrixError> {
        let Some(matrix) = job.matrix.as_ref() else {
            return Ok(MatrixExpansion {
                template: job.name.clone(),
                assignments: vec![MatrixAssignment::new()],
                fail_fast: true,
                max_parallel: None,
            });
        };

        self.check(job, &matrix.dimensions, &matrix.include, &matrix.exclude)?;

        let mut assignments = if matrix.dimensions.is_empty() && !matrix.include.is_empty() {
            vec![]
        } else {
            self.generate_combinations(&matrix.dimensions)
        };

        assignments.retain(|combo| !matrix.exclude.iter().any(|exclude| combo.contains_all(exclude)));

        for include in &matrix.include {
            let assignment = MatrixAssignment::from(include.clone());
            if !assignments.contains(&assignment) {
                assignments.push(assignment);
            }
        }

        if assignments.is_empty() {
            return Err(MatrixError::NoCombinations {
                job: job.name.clone(),
            });
        }

        Ok(MatrixExpansion {
            template: job.name.clone(),
            assignments,
            fail_fast: matrix.fail_fast,
            max_parallel: matrix.max_parallel,
        })
    }

    fn check(
        &self,
        job: &JobDefinition,
        dimensions: &IndexMap<String, Vec<serde_json::Value>>,
        include: &[IndexMap<String, serde_json::Value>],
        exclude: &[IndexMap<String, serde_json::Value>],
    ) -> Result<(), MatrixError> {
        if let Some((axis, _)) = dimensions.iter().find(|(_, values)| values.is_empty()) {
            return Err(MatrixError::EmptyAxis {
                job: job.name.clone(),
                axis: axis.clone(),
            });
        }

        for (index, entry) in exclude.iter().enumerate() {
            if entry.is_empty() {
                return Err(MatrixError::EmptyExclude {
                    job: job.name.clone(),
                    index,
                });
            }
            if let Some(axis) = entry.keys().find(|axis| !dimensions.contains_key(*axis)) {
                return Err(MatrixError::UnknownExcludeAxis {
                    job: job.name.clone(),
                    index,
                    axis: axis.clone(),
                });
            }
        }

        if let Some(index) = include.iter().position(IndexMap::is_empty) {
            return Err(MatrixError::EmptyInclude {
                job: job.name.clone(),
                index,
            });
        }
        Ok(())
    }

    /// Cross product. The first axis varies slowest.
    fn generate_combinations(
        &self,
        dimensions: &IndexMap<String, Vec<serde_json::Value>>,
    ) -> Vec<MatrixAssignment> {
        let mut result = vec![MatrixAssignment::new()];

        for (axis, values) in dimensions {
            let mut next = Vec::with_capacity(result.len() * values.len());
            for combo in &result {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(axis.clone(), value.clone());
                    next.push(extended);
                }
            }
            result = next;
        }

        result
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashSet;

    fn job(matrix: serde_json::Value) -> JobDefinition {
        serde_json::from_value(json!({
            "name": "test",
            "matrix": matrix,
            "steps": [{ "name": "run", "run": "cargo test" }]
        }))
        .unwrap()
    }

    fn keys(expansion: &MatrixExpansion) -> Vec<String> {
        expansion
            .assignments
            .iter()
            .map(|a| a.instance_key(&expansion.template).to_string())
            .collect()
    }

    #[test]
    fn test_matrix_expansion() {
        let expansion = MatrixExpander::new()
            .expand(&job(json!({
                "dimensions": { "os": ["linux", "macos"], "version": ["18", "20", "22"] },
                "max_parallel": 4
            })))
            .unwrap();

        assert_eq!(expansion.len(), 6);
        assert!(expansion.fail_fast);
        assert_eq!(expansion.max_parallel, Some(4));
        let unique: HashSet<String> = keys(&expansion).into_iter().collect();
        assert_eq!(unique.len(), 6);
        assert_eq!(keys(&expansion)[0], "test[os=linux, version=18]");
        assert_eq!(keys(&expansion)[1], "test[os=linux, version=20]");
    }

    #[test]
    fn test_matrix_with_exclude() {
        let expansion = MatrixExpander::new()
            .expand(&job(json!({
                "dimensions": { "os": ["linux", "macos"], "arch": ["amd64", "arm64"] },
                "exclude": [{ "os": "macos", "arch": "amd64" }]
            })))
            .unwrap();
        assert_eq!(expansion.len(), 3);
        assert!(!keys(&expansion).contains(&"test[arch=amd64, os=macos]".to_string()));
    }

    #[test]
    fn test_subset_exclude_removes_all_agreeing() {
        let expansion = MatrixExpander::new()
            .expand(&job(json!({
                "dimensions": { "os": ["linux", "windows"], "toolchain": ["stable", "1.80", "nightly"] },
                "exclude": [{ "os": "windows" }]
            })))
            .unwrap();
        assert_eq!(
            keys(&expansion),
            vec![
                "test[os=linux, toolchain=stable]",
                "test[os=linux, toolchain=1.80]",
                "test[os=linux, toolchain=nightly]",
            ]
        );
    }

    #[test]
    fn test_include_appends_and_deduplicates() {
        let expansion = MatrixExpander::new()
            .expand(&job(json!({
                "dimensions": { "os": ["linux"], "toolchain": ["stable"] },
                "include": [
                    { "toolchain": "stable", "os": "linux" },
                    { "os": "linux", "toolchain": "nightly", "experimental": true }
                ]
            })))
            .unwrap();
        assert_eq!(
            keys(&expansion),
            vec![
                "test[os=linux, toolchain=stable]",
                "test[experimental=true, os=linux, toolchain=nightly]",
            ]
        );
    }

    #[test]
    fn test_yaml_axis_order_is_kept() {
        let yaml = r#"
name: build
matrix:
  dimensions:
    os: [ubuntu-latest, windows-latest]
    features: ["", "--all-features"]
    toolchain: [stable]
steps:
  - name: test
    run: cargo test
"#;
        let job: JobDefinition = serde_yaml::from_str(yaml).unwrap();
        let expansion = MatrixExpander::new().expand(&job).unwrap();
        assert_eq!(
            keys(&expansion),
            vec![
                "build[os=ubuntu-latest, features=, toolchain=stable]",
                "build[os=ubuntu-latest, features=--all-features, toolchain=stable]",
                "build[os=windows-latest, features=, toolchain=stable]",
                "build[os=windows-latest, features=--all-features, toolchain=stable]",
            ]
        );
    }

    #[test]
    fn test_no_matrix_is_single_instance() {
        let plain: JobDefinition = serde_json::from_value(json!({
            "name": "lint",
            "steps": [{ "name": "clippy", "run": "cargo clippy" }]
        }))
        .unwrap();
        let expansion = MatrixExpander::new().expand(&plain).unwrap();
        assert_eq!(keys(&expansion), vec!["lint"]);
    }

    #[test]
    fn test_zero_axes() {
        let expander = MatrixExpander::new();
        let empty = expander.expand(&job(json!({ "dimensions": {} }))).unwrap();
        assert_eq!(keys(&empty), vec!["test"]);

        let includes = expander
            .expand(&job(json!({
                "include": [{ "target": "wasm32" }, { "target": "wasm32" }, { "target": "x86_64" }]
            })))
            .unwrap();
        assert_eq!(keys(&includes), vec!["test[target=wasm32]", "test[target=x86_64]"]);
    }

    #[test]
    fn test_configuration_errors() {
        let expander = MatrixExpander::new();
        assert!(matches!(
            expander.expand(&job(json!({ "dimensions": { "os": [] } }))),
            Err(MatrixError::EmptyAxis { .. })
        ));
        assert!(matches!(
            expander.expand(&job(json!({ "dimensions": { "os": ["a"] }, "exclude": [{}] }))),
            Err(MatrixError::EmptyExclude { index: 0, .. })
        ));
        assert!(matches!(
            expander.expand(&job(json!({ "dimensions": { "os": ["a"] }, "exclude": [{ "arch": "x" }] }))),
            Err(MatrixError::UnknownExcludeAxis { .. })
        ));
        assert!(matches!(
            expander.expand(&job(json!({ "dimensions": { "os": ["a"] }, "include": [{}] }))),
            Err(MatrixError::EmptyInclude { .. })
        ));
        assert!(matches!(
            expander.expand(&job(json!({ "dimensions": { "os": ["a"] }, "exclude": [{ "os": "a" }] }))),
            Err(MatrixError::NoCombinations { .. })
        ));

        let err: pipewright_core::Error = MatrixError::NoCombinations { job: "x".to_string() }.into();
        assert!(err.is_configuration());
    }
}
