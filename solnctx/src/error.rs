//! Error types for the solution execution context.

use thiserror::Error;

use crate::dims::DimKind;

/// The main error type for all context operations.
///
/// Every variant is raised synchronously by the call that violated a
/// contract and aborts only that call. Nothing in the crate retries.
#[derive(Error, Debug)]
pub enum SolnError {
    /// A grid with this name is already registered in the context.
    #[error("grid '{name}' already exists")]
    DuplicateName {
        /// The conflicting grid name.
        name: String,
    },

    /// A setting or query was used against a dimension of the wrong kind.
    #[error("'{api}()' called with dimension '{dim}' of kind {actual}, expected one of {allowed:?}")]
    InvalidDimensionKind {
        /// The accessor that rejected the dimension.
        api: &'static str,
        /// The dimension name.
        dim: String,
        /// The declared kind of the dimension.
        actual: DimKind,
        /// The kinds the accessor accepts.
        allowed: &'static [DimKind],
    },

    /// The dimension name was never declared for this solution.
    #[error("'{api}()' called with unknown dimension '{dim}'")]
    UnknownDimension {
        /// The accessor that rejected the dimension.
        api: &'static str,
        /// The dimension name.
        dim: String,
    },

    /// A query that needs a prepared solution was issued before `prepare()`.
    #[error("'{api}()' called before calling 'prepare()'")]
    NotPrepared {
        /// The accessor that requires the prepared phase.
        api: &'static str,
    },

    /// A recognized command-line option carried a missing or malformed value.
    #[error("invalid value {value:?} for option '{name}'")]
    InvalidOption {
        /// The option name without leading dashes.
        name: String,
        /// The offending value, if any was present.
        value: Option<String>,
    },

    /// The allocator could not provide a buffer.
    #[error("failed to allocate {bytes} bytes of {category} memory: {source}")]
    Allocation {
        /// The buffer category being allocated.
        category: &'static str,
        /// The requested size in bytes.
        bytes: usize,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A rayon thread pool could not be built.
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Storage sharing was requested from a grid that has no storage.
    #[error("grid '{name}' in the source context has no storage to share")]
    NoStorage {
        /// The grid name.
        name: String,
    },

    /// A settings document could not be read or parsed.
    #[error("failed to load settings: {0}")]
    Settings(#[from] serde_json::Error),
}

/// Type alias for `Result<T, SolnError>`.
pub type Result<T> = std::result::Result<T, SolnError>;
