use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrewError {
    #[error("No available formula for {name}{}", dependent_suffix(.name, .dependent))]
    FormulaUnavailable {
        name: String,
        dependent: Option<String>,
    },

    #[error("Invalid formula {name}: {reason}")]
    FormulaSpecification { name: String, reason: String },

    #[error("Circular dependency detected: {}", .chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("{formula}: {}", unsatisfied_message(.requirements))]
    UnsatisfiedRequirements {
        formula: String,
        requirements: Vec<String>,
    },

    #[error("{formula} dependency {dependency} not installed with: {}", .missing.join(", "))]
    UnsatisfiedDependency {
        formula: String,
        dependency: String,
        missing: Vec<String>,
    },

    #[error("Cannot install {formula}: {reason}")]
    CannotInstall { formula: String, reason: String },

    #[error("{formula} {version} already installed{}", linked_suffix(.linked))]
    AlreadyInstalled {
        formula: String,
        version: String,
        linked: bool,
    },

    #[error("Formula installation already attempted: {0}")]
    AlreadyAttempted(String),

    #[error("Operation already in progress for {0}")]
    OperationInProgress(String),

    #[error("{formula}: failed executing `{command}` (exit status {status}), logs in {}", .logs.display())]
    BuildFailed {
        formula: String,
        command: String,
        status: i32,
        logs: PathBuf,
    },

    #[error("Could not symlink {}: target {} already exists{}", .source_path.display(), .target.display(), existing_suffix(.existing))]
    LinkConflict {
        source_path: PathBuf,
        target: PathBuf,
        existing: Option<PathBuf>,
    },

    #[error("Cannot link {formula}: another version is already linked: {}", .linked.display())]
    AlreadyLinked { formula: String, linked: PathBuf },

    #[error("Failed to relocate {}: {reason}", .path.display())]
    Relocation { path: PathBuf, reason: String },

    #[error("{} is not inside a keg", .0.display())]
    NotAKeg(PathBuf),

    #[error("No such keg: {}", .0.display())]
    NoSuchKeg(PathBuf),

    #[error("SHA256 mismatch for {}\nExpected: {expected}\nActual: {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Download failed: {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("Interrupted")]
    Interrupted,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to walk directory: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BrewError {
    /// Conditions that end an install early without being failures.
    pub fn is_short_circuit(&self) -> bool {
        matches!(
            self,
            BrewError::AlreadyInstalled { .. } | BrewError::AlreadyAttempted(_)
        )
    }

    /// Attach the requesting formula to an unavailable-formula error.
    pub fn with_dependent(self, dependent: &str) -> Self {
        match self {
            BrewError::FormulaUnavailable {
                name,
                dependent: None,
            } if name != dependent => BrewError::FormulaUnavailable {
                name,
                dependent: Some(dependent.to_string()),
            },
            other => other,
        }
    }
}

fn dependent_suffix(name: &str, dependent: &Option<String>) -> String {
    match dependent {
        Some(d) if d != name => format!(" (dependency of {})", d),
        _ => String::new(),
    }
}

fn unsatisfied_message(reqs: &[String]) -> String {
    if reqs.len() == 1 {
        format!("An unsatisfied requirement failed this build: {}", reqs[0])
    } else {
        format!("Unsatisfied requirements failed this build: {}", reqs.join(", "))
    }
}

fn linked_suffix(linked: &bool) -> &'static str {
    if *linked { "" } else { ", it's just not linked" }
}

fn existing_suffix(existing: &Option<PathBuf>) -> String {
    match existing {
        Some(p) => format!(" and points to {}", p.display()),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, BrewError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_mentions_dependent() {
        let err = BrewError::FormulaUnavailable {
            name: "libfoo".to_string(),
            dependent: None,
        }
        .with_dependent("bar");
        assert_eq!(
            err.to_string(),
            "No available formula for libfoo (dependency of bar)"
        );
    }

    #[test]
    fn test_dependent_not_added_for_self() {
        let err = BrewError::FormulaUnavailable {
            name: "foo".to_string(),
            dependent: None,
        }
        .with_dependent("foo");
        assert_eq!(err.to_string(), "No available formula for foo");
    }

    #[test]
    fn test_short_circuit_classification() {
        assert!(BrewError::AlreadyAttempted("foo".into()).is_short_circuit());
        assert!(
            BrewError::AlreadyInstalled {
                formula: "foo".into(),
                version: "1.0".into(),
                linked: true
            }
            .is_short_circuit()
        );
        assert!(!BrewError::OperationInProgress("foo".into()).is_short_circuit());
    }
}
