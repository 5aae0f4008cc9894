//! Error classification for the reconciliation core.
//!
//! The reconciler only ever looks at the top-level variant: [`Error::Retryable`]
//! means "requeue with backoff until the limit is hit", anything else means "log
//! and drop". Call sites are responsible for treating `NotFound` as success
//! before an error ever reaches this type -- see [`is_not_found`].

use eyre::Report;

#[derive(Debug)]
pub enum Error {
    /// Transient failure (API conflict, partial DNS failure, a create/update/delete
    /// that isn't a `NotFound`). The reconciler re-enqueues with rate limiting.
    Retryable(Report),
    /// Terminal for this event. Logged and dropped, never retried.
    Terminal(Report),
}

impl Error {
    pub fn retryable(err: impl Into<Report>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn terminal(err: impl Into<Report>) -> Self {
        Self::Terminal(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn report(&self) -> &Report {
        match self {
            Self::Retryable(r) | Self::Terminal(r) => r,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable(r) => write!(f, "retryable: {r}"),
            Self::Terminal(r) => write!(f, "terminal: {r}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Retryable(err.into())
    }
}

/// True when a `kube::Error` represents the API server's 404 -- everywhere in this
/// crate, a delete/lookup that hits `NotFound` is treated as "already satisfied".
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True when a create hit the API server's 409 `AlreadyExists` -- every create
/// in this crate tolerates it rather than treating it as a failure (§9 "every
/// create tolerates already exists").
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.reason == "AlreadyExists")
}

/// Folds a batch of fallible operations into a single retryable error, the way
/// `cleanupOrphanedServices`/`cleanupMirroredResources` aggregate per-object
/// failures. Returns `Ok(())` when every operation succeeded.
pub fn aggregate(errors: Vec<Report>) -> Result<(), Error> {
    if errors.is_empty() {
        return Ok(());
    }

    let combined = errors
        .into_iter()
        .fold(eyre::eyre!("one or more operations failed"), |acc, err| {
            acc.wrap_err(err.to_string())
        });

    Err(Error::Retryable(combined))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_detected() {
        let err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });

        assert!(is_not_found(&err));
    }

    #[test]
    fn already_exists_is_detected() {
        let err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "already exists".into(),
            reason: "AlreadyExists".into(),
            code: 409,
        });

        assert!(is_already_exists(&err));
    }

    #[test]
    fn conflict_is_not_not_found() {
        let err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "conflict".into(),
            reason: "Conflict".into(),
            code: 409,
        });

        assert!(!is_not_found(&err));
    }

    #[test]
    fn aggregate_empty_is_ok() {
        assert!(aggregate(vec![]).is_ok());
    }

    #[test]
    fn aggregate_nonempty_is_retryable() {
        let err = aggregate(vec![eyre::eyre!("boom")]).unwrap_err();
        assert!(err.is_retryable());
    }
}
