// Data provider trait for remote signal access
use crate::domain::{Decimation, FetchRequest, FetchResult};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// The request asked for more samples than the provider will return.
    /// Callers may retry once with a smaller `max_samples`.
    #[error("sample limit exceeded for '{variable}' (requested {requested})")]
    SampleLimitExceeded { variable: String, requested: usize },

    /// The provider answered with an error code.
    #[error("{message}")]
    Rejected { code: i32, message: String },

    #[error("provider unreachable: {0}")]
    Network(String),

    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn code(&self) -> i32 {
        match self {
            ProviderError::SampleLimitExceeded { .. } => -2,
            ProviderError::Rejected { code, .. } => *code,
            ProviderError::Network(_) => -3,
            ProviderError::Decode(_) => -4,
        }
    }

    pub fn is_sample_limit(&self) -> bool {
        matches!(self, ProviderError::SampleLimitExceeded { .. })
    }
}

/// Which half of an envelope to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeBound {
    Min,
    Max,
}

impl From<EnvelopeBound> for Decimation {
    fn from(bound: EnvelopeBound) -> Self {
        match bound {
            EnvelopeBound::Min => Decimation::Min,
            EnvelopeBound::Max => Decimation::Max,
        }
    }
}

#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Human-readable name of this backend.
    fn name(&self) -> &str;

    /// Fetch one variable over the requested window.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, ProviderError>;

    /// Fetch one bound of a decimated envelope.
    ///
    /// The default asks `fetch` for min/max decimation; backends with a
    /// native envelope call override this.
    async fn fetch_envelope(
        &self,
        request: &FetchRequest,
        bound: EnvelopeBound,
    ) -> Result<FetchResult, ProviderError> {
        self.fetch(&request.with_decimation(bound.into())).await
    }
}
