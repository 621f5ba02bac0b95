//! Error types for the Kiln execution runtime.
//!
//! Provides the error hierarchy for module compilation, fragment execution,
//! and the adaptive optimization loop.

use strsim::jaro_winkler;
use thiserror::Error;

/// The primary error type for Kiln operations.
#[derive(Error, Debug)]
pub enum KilnError {
    /// Compilation error (function lookup or lowering failure)
    #[error("Compilation error: {message}")]
    Compile { message: String },

    /// Query execution error
    #[error("Execution error: {message}")]
    Execution { message: String },

    /// Cooperative abort raised from inside compiled code.
    ///
    /// Recovered by the fragment runtime (teardown functions run, the
    /// fragment returns cleanly); never surfaced to callers as a failure.
    #[error("Fragment aborted cooperatively")]
    FragmentAbort,

    /// Invalid argument
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Internal error (bug in the engine)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl KilnError {
    /// Create a compilation error.
    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile {
            message: message.into(),
        }
    }

    /// Create an execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a compilation error for a function that could not be resolved
    /// in a module, with suggestions for similar names.
    pub fn function_not_found(not_found: &str, available: &[String]) -> Self {
        let suggestions = find_similar_names(not_found, available, 3);
        let mut message = format!("Function '{}' not found in module", not_found);

        if !suggestions.is_empty() {
            message.push_str(". Did you mean: ");
            message.push_str(&suggestions.join(", "));
            message.push('?');
        }

        Self::Compile { message }
    }
}

/// Find similar names using Jaro-Winkler distance.
///
/// Returns up to `max_suggestions` names that are similar to `target`,
/// sorted by similarity (most similar first).
pub fn find_similar_names(target: &str, candidates: &[String], max_suggestions: usize) -> Vec<String> {
    const MIN_SIMILARITY: f64 = 0.7; // Threshold for considering a match

    let target_lower = target.to_lowercase();

    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .map(|c| {
            let similarity = jaro_winkler(&target_lower, &c.to_lowercase());
            (similarity, c)
        })
        .filter(|(score, _)| *score >= MIN_SIMILARITY)
        .collect();

    // Sort by similarity (highest first)
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    scored
        .into_iter()
        .take(max_suggestions)
        .map(|(_, name)| name.clone())
        .collect()
}

/// Result type alias for Kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KilnError::execution("step failed");
        assert_eq!(err.to_string(), "Execution error: step failed");
    }

    #[test]
    fn test_find_similar_names() {
        let candidates = vec![
            "pipeline0_step".to_string(),
            "pipeline0_teardown".to_string(),
            "main".to_string(),
        ];

        let suggestions = find_similar_names("pipeline0_stp", &candidates, 3);
        assert!(!suggestions.is_empty());
        assert!(suggestions.contains(&"pipeline0_step".to_string()));

        let suggestions = find_similar_names("xyz123", &candidates, 3);
        assert!(suggestions.is_empty());
    }

    #[test]
    fn test_function_not_found_with_suggestions() {
        let available = vec!["query_step_0".to_string(), "query_teardown".to_string()];

        let err = KilnError::function_not_found("query_stepp_0", &available);
        let msg = err.to_string();

        assert!(msg.contains("Function 'query_stepp_0' not found"));
        assert!(msg.contains("Did you mean"));
        assert!(msg.contains("query_step_0"));
    }
}
