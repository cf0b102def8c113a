use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by the store traits in tether-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// A single schema violation found while validating a trigger payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path of the offending field (`""` for the payload root).
    pub path: String,
    pub message: String,
}

/// A trigger payload was rejected by the job's declared schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("payload validation failed: {}", summarize(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ValidationIssue {
                path: path.into(),
                message: message.into(),
            }],
        }
    }
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| {
            if i.path.is_empty() {
                i.message.clone()
            } else {
                format!("{}: {}", i.path, i.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_validation_error_lists_every_issue() {
        let err = ValidationError {
            issues: vec![
                ValidationIssue {
                    path: "message".to_string(),
                    message: "is required".to_string(),
                },
                ValidationIssue {
                    path: String::new(),
                    message: "payload must be an object".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("message: is required"));
        assert!(text.contains("payload must be an object"));
    }
}
