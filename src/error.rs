//! Typed error taxonomy.
//!
//! Library functions return `anyhow::Result` and raise these variants with
//! `.into()`. Callers that need to branch on the failure class (the HTTP layer,
//! the CLI exit path) recover them with [`classify`].

/// Failure classes surfaced by the knowledge-base and conflict-detection core.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// A project knowledge base or job does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The caller supplied unusable input.
    #[error("{0}")]
    BadInput(String),

    /// The embedding or LLM backend failed or returned unusable output.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// A required backend is not configured or could not be constructed.
    #[error("dependency unavailable: {0}\nSuggestion: {1}")]
    DependencyUnavailable(String, String),

    /// The LLM answer could not be parsed, even after salvage.
    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    /// On-disk index and metadata disagree.
    #[error("inconsistent knowledge base: {0}")]
    Inconsistent(String),
}

impl KbError {
    pub fn not_found_kb(project_id: &str) -> Self {
        KbError::NotFound(format!(
            "Knowledge base not found for project {}. Build it first.",
            project_id
        ))
    }

    pub fn embeddings_unavailable() -> Self {
        KbError::DependencyUnavailable(
            "embedding provider is disabled".to_string(),
            "set [embedding].provider to hash, local, openai, or ollama".to_string(),
        )
    }

    pub fn llm_unavailable() -> Self {
        KbError::DependencyUnavailable(
            "LLM provider is disabled".to_string(),
            "set [llm].provider to groq or openai and export its API key".to_string(),
        )
    }
}

/// Find the first [`KbError`] in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&KbError> {
    err.chain().find_map(|e| e.downcast_ref::<KbError>())
}
