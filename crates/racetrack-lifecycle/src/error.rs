//! Error types for racetrack-lifecycle.

/// Result type alias using [`LifecycleError`].
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors that can occur in the lifecycle service.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// User-correctable input problem (bad manifest, bad request).
    #[error("{0}")]
    Validation(String),

    /// Job, family, deployment or other record does not exist.
    #[error("{0}")]
    EntityNotFound(String),

    /// Record with the same identity already exists.
    #[error("{0}")]
    AlreadyExists(String),

    /// Another operation is holding the same resource.
    #[error("{0}")]
    Conflict(String),

    /// Caller lacks the permission for the operation.
    #[error("permission denied: {0}")]
    Unauthorized(String),

    /// An error wrapped with the name of the stage it happened in.
    #[error("{context}: {source}")]
    Context {
        /// Stage or activity description.
        context: String,
        /// The underlying error.
        source: Box<LifecycleError>,
    },

    /// Infrastructure target reported a failure.
    #[error("{0}")]
    Infrastructure(String),

    /// A bounded wait elapsed.
    #[error("{0}")]
    Timeout(String),

    /// Infrastructure target doesn't implement the operation.
    #[error("{0} is not supported")]
    Unsupported(String),

    /// Image builder reported a failure.
    #[error("image building failed: {0}")]
    Builder(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Update matched no rows.
    #[error("no rows affected: {0}")]
    NoRowsAffected(String),

    /// Update matched more rows than expected.
    #[error("too many rows affected ({affected}): {what}")]
    TooManyRowsAffected {
        /// Description of the record being updated.
        what: String,
        /// Number of rows actually affected.
        affected: u64,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::EntityNotFound(msg.into())
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an infrastructure error.
    #[must_use]
    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap this error with a stage description.
    #[must_use]
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error of a context chain.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut current = self;
        while let Self::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Whether the error denotes a missing record.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Self::EntityNotFound(_))
    }
}

/// Adds stage context to fallible results.
pub trait ResultExt<T> {
    /// Wrap the error, if any, with a fixed stage description.
    fn context(self, context: impl Into<String>) -> LifecycleResult<T>;

    /// Wrap the error, if any, with a lazily built stage description.
    fn with_context<S, F>(self, f: F) -> LifecycleResult<T>
    where
        S: Into<String>,
        F: FnOnce() -> S;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<LifecycleError>,
{
    fn context(self, context: impl Into<String>) -> LifecycleResult<T> {
        self.map_err(|e| e.into().wrap(context))
    }

    fn with_context<S, F>(self, f: F) -> LifecycleResult<T>
    where
        S: Into<String>,
        F: FnOnce() -> S,
    {
        self.map_err(|e| e.into().wrap(f()))
    }
}

impl From<serde_json::Error> for LifecycleError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialisation(e.to_string())
    }
}

impl From<serde_yaml::Error> for LifecycleError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialisation(e.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn context_chain_reads_general_to_specific() {
        let result: LifecycleResult<()> = Err(LifecycleError::infrastructure("port taken"));
        let err = result
            .context("creating cluster resources")
            .context("provisioning job")
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "provisioning job: creating cluster resources: port taken"
        );
        assert!(matches!(err.root_cause(), LifecycleError::Infrastructure(_)));
    }

    #[test]
    fn not_found_survives_wrapping() {
        let err = LifecycleError::not_found("job adder v1 not found").wrap("deleting job");
        assert!(err.is_not_found());
        assert!(!LifecycleError::internal("boom").is_not_found());
    }
}
