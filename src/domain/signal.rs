// Signal buffer domain models
use super::fetch::FetchResult;
use serde::Serialize;

/// The x/y/(z) buffers a signal node exposes to callers.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SignalData {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Option<Vec<f64>>,
    pub x_unit: String,
    pub y_unit: String,
}

impl SignalData {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    pub fn with_units(mut self, x_unit: impl Into<String>, y_unit: impl Into<String>) -> Self {
        self.x_unit = x_unit.into();
        self.y_unit = y_unit.into();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty() && self.y.is_empty()
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Smallest and largest x value, ignoring NaN.
    pub fn x_bounds(&self) -> Option<(f64, f64)> {
        self.x
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// Expand a single-element y (or z) to the length of x.
    ///
    /// Any other length mismatch is left untouched for the caller.
    pub fn broadcast_scalars(&mut self) {
        let n = self.x.len();
        if n > 1 {
            if self.y.len() == 1 {
                self.y = broadcast(self.y[0], n);
            }
            if let Some(z) = self.z.as_mut() {
                if z.len() == 1 {
                    *z = broadcast(z[0], n);
                }
            }
        }
    }
}

impl From<FetchResult> for SignalData {
    fn from(result: FetchResult) -> Self {
        Self {
            x: result.x,
            y: result.y,
            z: result.z,
            x_unit: result.x_unit,
            y_unit: result.y_unit,
        }
    }
}

// Linear interpolation between two equal endpoints is the constant itself.
fn broadcast(value: f64, n: usize) -> Vec<f64> {
    vec![value; n]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_scalar_y() {
        let mut data = SignalData::new(vec![0.0, 1.0, 2.0], vec![5.0]).with_units("s", "A");
        data.z = Some(vec![7.0]);
        data.broadcast_scalars();
        assert_eq!(data.y, vec![5.0, 5.0, 5.0]);
        assert_eq!(data.z, Some(vec![7.0, 7.0, 7.0]));
        assert_eq!(data.x_unit, "s");
    }

    #[test]
    fn test_other_mismatch_passes_through() {
        let mut data = SignalData::new(vec![0.0, 1.0, 2.0], vec![5.0, 6.0]);
        data.broadcast_scalars();
        assert_eq!(data.y, vec![5.0, 6.0]);
    }

    #[test]
    fn test_x_bounds_skips_nan() {
        let data = SignalData::new(vec![f64::NAN, 3.0, -1.0, 2.0], vec![]);
        assert_eq!(data.x_bounds(), Some((-1.0, 3.0)));
        assert_eq!(SignalData::default().x_bounds(), None);
    }
}
