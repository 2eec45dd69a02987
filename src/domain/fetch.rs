// Fetch request/result domain models
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the time bounds of a request are interpreted by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    /// Relative to the pulse/shot origin.
    #[default]
    Relative,
    /// Absolute wall-clock time.
    Absolute,
}

impl TimeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFormat::Relative => "relative",
            TimeFormat::Absolute => "absolute",
        }
    }
}

/// Server-side decimation requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decimation {
    Mean,
    Min,
    Max,
}

impl Decimation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decimation::Mean => "mean",
            Decimation::Min => "min",
            Decimation::Max => "max",
        }
    }
}

/// An immutable request for one variable over one time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub source_id: String,
    pub variable: String,
    pub pulse_id: Option<i64>,
    pub time_start: Option<f64>,
    pub time_end: Option<f64>,
    pub time_format: TimeFormat,
    pub max_samples: usize,
    pub decimation: Option<Decimation>,
    pub want_envelope: bool,
}

impl FetchRequest {
    /// Copy of this request with a smaller sample budget.
    pub fn with_max_samples(&self, max_samples: usize) -> Self {
        Self {
            max_samples,
            ..self.clone()
        }
    }

    /// Copy of this request asking for one envelope bound.
    pub fn with_decimation(&self, decimation: Decimation) -> Self {
        Self {
            decimation: Some(decimation),
            ..self.clone()
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::from_request(self)
    }
}

/// Buffers returned by a provider or by the streaming decoder.
///
/// `error_code == 0` means success. On failure every buffer is empty, so
/// callers can always iterate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FetchResult {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Envelope maximum, present only for envelope requests.
    pub z: Option<Vec<f64>>,
    pub x_unit: String,
    pub y_unit: String,
    pub is_downsampled: bool,
    pub error_code: i32,
    pub error_message: String,
}

impl FetchResult {
    pub fn new(x: Vec<f64>, y: Vec<f64>, x_unit: impl Into<String>, y_unit: impl Into<String>) -> Self {
        Self {
            x,
            y,
            x_unit: x_unit.into(),
            y_unit: y_unit.into(),
            ..Self::default()
        }
    }

    /// Empty-but-valid result (no samples, no error).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn failure(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            error_code: if error_code == 0 { -1 } else { error_code },
            error_message: message.into(),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty() && self.y.is_empty()
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }
}

/// Canonical subset of a request that decides cache equivalence.
///
/// Field order is fixed here, so two requests built in any order hash equally.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    variable: &'a str,
    time_start: Option<f64>,
    time_end: Option<f64>,
    pulse_id: Option<i64>,
    max_samples: usize,
    source_id: &'a str,
    want_envelope: bool,
    time_format: TimeFormat,
}

/// Content address of a fetch: hex BLAKE3 digest of the canonical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_request(request: &FetchRequest) -> Self {
        let canonical = CanonicalRequest {
            variable: &request.variable,
            time_start: request.time_start,
            time_end: request.time_end,
            pulse_id: request.pulse_id,
            max_samples: request.max_samples,
            source_id: &request.source_id,
            want_envelope: request.want_envelope,
            time_format: request.time_format,
        };
        // Plain structs of numbers and strings always serialize.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of the range parameters that drive the refresh policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeHash([u8; 32]);

impl RangeHash {
    pub fn new(
        time_start: Option<f64>,
        time_end: Option<f64>,
        max_samples: usize,
        pulse_id: Option<i64>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        for bound in [time_start, time_end] {
            match bound {
                Some(v) => {
                    hasher.update(&[1]);
                    hasher.update(&v.to_le_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        hasher.update(&(max_samples as u64).to_le_bytes());
        match pulse_id {
            Some(p) => {
                hasher.update(&[1]);
                hasher.update(&p.to_le_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        Self(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> FetchRequest {
        FetchRequest {
            source_id: "tokamak".to_string(),
            variable: "ip".to_string(),
            pulse_id: Some(30420),
            time_start: Some(100.0),
            time_end: Some(200.0),
            time_format: TimeFormat::Relative,
            max_samples: 1000,
            decimation: None,
            want_envelope: false,
        }
    }

    #[test]
    fn test_cache_key_ignores_decimation() {
        let a = request();
        let b = a.with_decimation(Decimation::Max);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_cache_key_sensitive_to_range_fields() {
        let base = request().cache_key();

        let mut r = request();
        r.time_start = Some(101.0);
        assert_ne!(base, r.cache_key());

        let mut r = request();
        r.time_end = Some(201.0);
        assert_ne!(base, r.cache_key());

        let mut r = request();
        r.pulse_id = Some(30421);
        assert_ne!(base, r.cache_key());

        assert_ne!(base, request().with_max_samples(999).cache_key());

        let mut r = request();
        r.want_envelope = true;
        assert_ne!(base, r.cache_key());
    }

    #[test]
    fn test_range_hash_distinguishes_missing_bounds() {
        let a = RangeHash::new(None, Some(1.0), 10, None);
        let b = RangeHash::new(Some(1.0), None, 10, None);
        assert_ne!(a, b);
        assert_eq!(a, RangeHash::new(None, Some(1.0), 10, None));
    }

    #[test]
    fn test_failure_result_has_nonzero_code_and_empty_buffers() {
        let result = FetchResult::failure(0, "boom");
        assert!(!result.is_ok());
        assert!(result.is_empty());
        assert!(result.z.is_none());
    }
}
