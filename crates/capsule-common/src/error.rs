//! Error types for capsule.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors surfaced to callers of a runtime context
//! - [`HostFunctionError`]: Errors from capability (host function) implementations
//! - [`CacheError`]: Failures of the script/resource cache, always recoverable

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur while resolving, fetching,
/// compiling, or executing a hosted program.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A local program directory holds no script files.
    #[error("No valid files found at {path}")]
    NoScripts {
        /// The directory that was searched.
        path: String,
    },

    /// The program identifier could not be resolved to a location.
    #[error("Invalid program name '{name}': {reason}")]
    InvalidProgram {
        /// The identifier as supplied by the caller.
        name: String,
        /// Why the identifier was rejected.
        reason: String,
    },

    /// A network round-trip failed before any response was received.
    #[error("Request to {url} failed: {message}")]
    Transport {
        /// The URL being requested.
        url: String,
        /// Description of the transport failure.
        message: String,
    },

    /// The program registry answered with a non-2xx status.
    #[error("Error loading program {program}: {source}")]
    Registry {
        /// The program that was being loaded.
        program: String,
        /// The rejected response.
        #[source]
        source: HostFunctionError,
    },

    /// Script compilation failed.
    #[error("Compilation of {name} failed: {message}")]
    Compilation {
        /// Name of the compiled unit (URL, file, or `<inline>`).
        name: String,
        /// Interpreter diagnostic.
        message: String,
    },

    /// Script execution failed.
    #[error("Execution failed: {message}")]
    Execution {
        /// Interpreter diagnostic.
        message: String,
    },

    /// An operation needs an access token and none was configured.
    #[error("Can't {operation} without an access token")]
    Unauthorized {
        /// The operation that was refused.
        operation: String,
    },

    /// A cache operation failed.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from capability implementations.
///
/// Inside a running script most of these are never raised; they are folded
/// into the `error` field of the value handed back to the script.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostFunctionError {
    /// A response arrived with a status outside `[200, 300)`.
    #[error("{body} (status code {status})")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body, as text.
        body: String,
    },

    /// The requested operation was denied by the host policy.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// Description of the resource that access was denied to.
        resource: String,
    },

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

/// Cache failures.
///
/// Every variant is treated as a miss by the load pipeline; they exist so
/// the reason can be logged.
#[derive(Error, Debug)]
pub enum CacheError {
    /// No entry exists for the key.
    #[error("No cache entry for {key}")]
    NotFound {
        /// The resource key.
        key: String,
    },

    /// An entry existed but its expiry has passed.
    #[error("Cache entry for {key} has expired")]
    Expired {
        /// The resource key.
        key: String,
    },

    /// Reading or writing the cache directory failed.
    #[error("Cache IO error: {0}")]
    Io(#[from] io::Error),

    /// An entry could not be encoded.
    #[error("Failed to encode cache entry: {0}")]
    Encode(String),

    /// An entry on disk is corrupt or was written by an incompatible version.
    #[error("Failed to decode cache entry: {0}")]
    Decode(String),

    /// The user's home directory could not be determined.
    #[error("Could not determine the home directory")]
    NoHomeDir,
}

impl RuntimeError {
    /// Create a new `InvalidProgram` error.
    pub fn invalid_program(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProgram {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `Transport` error.
    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a new `Compilation` error.
    pub fn compilation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compilation {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a new `Execution` error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl CacheError {
    /// Create a new `NotFound` error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Returns `true` if this error indicates a plain miss.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Expired { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::invalid_program("-bad", "must start with a letter or digit");
        assert_eq!(
            err.to_string(),
            "Invalid program name '-bad': must start with a letter or digit"
        );

        let err = HostFunctionError::HttpStatus {
            status: 404,
            body: "no such program".into(),
        };
        assert_eq!(err.to_string(), "no such program (status code 404)");
    }

    #[test]
    fn test_registry_error_wraps_status() {
        let err = RuntimeError::Registry {
            program: "hello".into(),
            source: HostFunctionError::HttpStatus {
                status: 403,
                body: "forbidden".into(),
            },
        };
        assert_eq!(
            err.to_string(),
            "Error loading program hello: forbidden (status code 403)"
        );
    }

    #[test]
    fn test_error_from_cache() {
        let runtime_err: RuntimeError = CacheError::not_found("http://x/").into();
        assert!(matches!(runtime_err, RuntimeError::Cache(_)));
    }

    #[test]
    fn test_is_miss() {
        assert!(CacheError::not_found("k").is_miss());
        assert!(CacheError::Expired { key: "k".into() }.is_miss());
        assert!(!CacheError::Decode("truncated".into()).is_miss());
    }
}
