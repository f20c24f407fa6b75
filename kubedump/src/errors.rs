//! Error types shared by the collectors
//!
//! Collectors distinguish between errors that end a run ([`Error`]) and
//! errors scoped to a single work item ([`ItemError`]). Item errors never
//! abort a collector; they are gathered into an [`Errors`] value that is
//! returned once every other item has been processed.

use crate::ssh::ShellError;
use std::{fmt, path::PathBuf};

/// Indicates that a collector could not complete
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller's cancellation token fired
    #[error("cancelled")]
    Cancelled,

    /// A remote shell could not be opened to a node
    #[error("unable to connect to {host}: {source}")]
    Connect {
        /// The address that was dialed
        host: String,
        /// The underlying connection failure
        #[source]
        source: ShellError,
    },

    /// A listing required to plan the run failed
    #[error("failed to list {what}: {source}")]
    Setup {
        /// The kind of object being listed
        what: &'static str,
        /// The API error
        #[source]
        source: kube_client::Error,
    },

    /// Resource discovery failed for every API group
    #[error("resource discovery failed: {0}")]
    Discovery(#[source] kube_client::Error),

    /// One or more work items failed
    #[error(transparent)]
    Items(#[from] Errors),
}

/// A failure scoped to a single work item
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    /// The Kubernetes API returned an error
    #[error("{context}: {source}")]
    Api {
        /// Describes the request that failed
        context: String,
        /// The API error
        #[source]
        source: kube_client::Error,
    },

    /// A local artifact could not be written
    #[error("failed to write {}: {source}", path.display())]
    Io {
        /// The artifact path
        path: PathBuf,
        /// The I/O error
        #[source]
        source: std::io::Error,
    },

    /// A listing could not be encoded as JSON
    #[error("failed to encode {context} as JSON: {source}")]
    Json {
        /// Describes the listing
        context: String,
        /// The encoding error
        #[source]
        source: serde_json::Error,
    },

    /// A listing could not be converted from JSON to YAML
    #[error("failed to convert {context} to YAML: {source}")]
    Yaml {
        /// Describes the listing
        context: String,
        /// The conversion error
        #[source]
        source: serde_yaml::Error,
    },

    /// A remote command failed
    #[error(transparent)]
    Shell(#[from] ShellError),

    /// The caller's cancellation token fired while the item was in flight
    #[error("cancelled")]
    Cancelled,
}

/// An accumulation of [`ItemError`]s
///
/// An empty value represents success; see [`Errors::into_result`].
#[derive(Debug, Default)]
pub struct Errors(Vec<ItemError>);

// === impl ItemError ===

impl ItemError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// === impl Errors ===

impl Errors {
    /// Appends an error
    pub fn push(&mut self, error: impl Into<ItemError>) {
        self.0.push(error.into());
    }

    /// Appends all errors from `other`
    pub fn extend(&mut self, other: Errors) {
        self.0.extend(other.0);
    }

    /// Returns true iff no errors have been accumulated
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of accumulated errors
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the accumulated errors
    pub fn iter(&self) -> impl Iterator<Item = &ItemError> {
        self.0.iter()
    }

    /// Returns `Ok` if no errors were accumulated, or `Err(self)` otherwise
    pub fn into_result(self) -> Result<(), Self> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<ItemError> for Errors {
    fn from(error: ItemError) -> Self {
        Self(vec![error])
    }
}

impl FromIterator<ItemError> for Errors {
    fn from_iter<I: IntoIterator<Item = ItemError>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Errors {
    type Item = ItemError;
    type IntoIter = std::vec::IntoIter<ItemError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "no errors"),
            [error] => write!(f, "{error}"),
            errors => {
                write!(f, "{} errors occurred:", errors.len())?;
                for error in errors {
                    write!(f, "\n\t* {error}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Errors {}

/// Returns the HTTP status code of an API error response, if `error` is one
pub(crate) fn status_code(error: &kube_client::Error) -> Option<u16> {
    match error {
        kube_client::Error::Api(kube_core::ErrorResponse { code, .. }) => Some(*code),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube_client::Error {
        kube_client::Error::Api(kube_core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn empty_is_ok() {
        assert!(Errors::default().into_result().is_ok());
    }

    #[test]
    fn accumulates() {
        let mut errors = Errors::default();
        errors.push(ItemError::Cancelled);
        let mut more = Errors::default();
        more.push(ItemError::Api {
            context: "failed to fetch logs for x/p/c".to_string(),
            source: api_error(401),
        });
        errors.extend(more);
        assert_eq!(errors.len(), 2);

        let err = errors.into_result().expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.starts_with("2 errors occurred:"), "{msg}");
        assert!(msg.contains("x/p/c"), "{msg}");
    }

    #[test]
    fn single_error_displays_inline() {
        let errors = Errors::from(ItemError::Cancelled);
        assert_eq!(errors.to_string(), "cancelled");
    }

    #[test]
    fn classifies_status_codes() {
        assert_eq!(status_code(&api_error(400)), Some(400));
        assert_eq!(status_code(&api_error(403)), Some(403));
        assert_eq!(status_code(&kube_client::Error::Service("boom".into())), None);
    }
}
