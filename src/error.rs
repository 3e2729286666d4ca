//! Error types for the service control client.

/// Status code a caller can match on, mirroring the subset of RPC
/// codes the client surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    OutOfRange,
    Unavailable,
}

/// Errors surfaced by the client and its aggregators.
///
/// Cache misses are not errors: aggregator lookups return `Option`
/// and the client translates `None` into a transport call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid service name: {got}, expecting: {want}")]
    ServiceNameMismatch { got: String, want: String },

    #[error("{field} field is required")]
    MissingField { field: &'static str },

    #[error("no transport is configured for this call")]
    TransportNotConfigured,

    #[error("invalid aggregation options: {0}")]
    InvalidOptions(String),

    #[error("invalid money value: {0}")]
    InvalidMoney(String),

    #[error("currency codes do not match: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    #[error("money addition overflows the representable range")]
    MoneyOutOfRange,

    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),

    #[error("distributions have incompatible bucket layouts")]
    IncompatibleDistributions,

    #[error("transport failed: {0}")]
    Transport(String),
}

impl Error {
    /// The RPC-style code for this error.
    pub fn code(&self) -> Code {
        match self {
            Error::MoneyOutOfRange => Code::OutOfRange,
            Error::Transport(_) => Code::Unavailable,
            _ => Code::InvalidArgument,
        }
    }
}
