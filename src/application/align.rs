// Grid alignment of sibling signals before expression evaluation
//
// Every sibling is resampled onto one common x grid by linear interpolation.
// Points outside a sibling's own span become NaN; nothing is extrapolated.
use crate::domain::SignalData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlignPolicy {
    /// Union of every sibling's x values.
    #[default]
    Union,
    /// Union restricted to the span all siblings cover.
    Overlap,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GridAligner {
    policy: AlignPolicy,
}

impl GridAligner {
    pub fn new(policy: AlignPolicy) -> Self {
        Self { policy }
    }

    /// Resample `signals` onto a common grid.
    ///
    /// Returns fresh buffers in input order; the inputs are never touched.
    /// A single signal passes through unchanged.
    pub fn align(&self, signals: &[SignalData]) -> Vec<SignalData> {
        if signals.len() <= 1 || shares_grid(signals) {
            return signals.to_vec();
        }

        let grid = self.common_grid(signals);
        tracing::debug!(
            "Aligned {} signals onto {} points ({:?})",
            signals.len(),
            grid.len(),
            self.policy
        );

        signals
            .iter()
            .map(|signal| {
                let (xs, ys, zs) = sorted_samples(signal);
                SignalData {
                    x: grid.clone(),
                    y: grid.iter().map(|t| interpolate(&xs, &ys, *t)).collect(),
                    z: zs.map(|zs| grid.iter().map(|t| interpolate(&xs, &zs, *t)).collect()),
                    x_unit: signal.x_unit.clone(),
                    y_unit: signal.y_unit.clone(),
                }
            })
            .collect()
    }

    fn common_grid(&self, signals: &[SignalData]) -> Vec<f64> {
        let mut grid: Vec<f64> = signals
            .iter()
            .flat_map(|s| s.x.iter().copied())
            .filter(|v| !v.is_nan())
            .collect();
        grid.sort_by(f64::total_cmp);
        grid.dedup();

        if self.policy == AlignPolicy::Overlap {
            let spans: Vec<(f64, f64)> = signals.iter().filter_map(SignalData::x_bounds).collect();
            let lo = spans.iter().map(|s| s.0).fold(f64::NEG_INFINITY, f64::max);
            let hi = spans.iter().map(|s| s.1).fold(f64::INFINITY, f64::min);
            grid.retain(|v| *v >= lo && *v <= hi);
        }

        grid
    }
}

fn shares_grid(signals: &[SignalData]) -> bool {
    let first = &signals[0].x;
    signals
        .iter()
        .all(|s| s.x.len() == first.len() && s.x.iter().zip(first).all(|(a, b)| a.to_bits() == b.to_bits()))
}

type Samples = (Vec<f64>, Vec<f64>, Option<Vec<f64>>);

/// Pair x with y (and z), drop NaN timestamps and sort by time.
///
/// A missing y or z sample is NaN, so an envelope with only its max side
/// still aligns.
fn sorted_samples(signal: &SignalData) -> Samples {
    let z = signal.z.as_deref();
    let sample = |values: Option<&[f64]>, i: usize| values.and_then(|v| v.get(i).copied()).unwrap_or(f64::NAN);
    let mut rows: Vec<(f64, f64, f64)> = signal
        .x
        .iter()
        .enumerate()
        .filter(|(_, x)| !x.is_nan())
        .map(|(i, x)| (*x, sample(Some(signal.y.as_slice()), i), sample(z, i)))
        .collect();
    rows.sort_by(|a, b| a.0.total_cmp(&b.0));

    let xs = rows.iter().map(|r| r.0).collect();
    let ys = rows.iter().map(|r| r.1).collect();
    let zs = z.map(|_| rows.iter().map(|r| r.2).collect());
    (xs, ys, zs)
}

fn interpolate(xs: &[f64], ys: &[f64], t: f64) -> f64 {
    let i = xs.partition_point(|v| *v < t);
    if i < xs.len() && xs[i] == t {
        return ys[i];
    }
    if i == 0 || i == xs.len() {
        return f64::NAN;
    }
    let (x0, x1) = (xs[i - 1], xs[i]);
    let (y0, y1) = (ys[i - 1], ys[i]);
    y0 + (y1 - y0) * (t - x0) / (x1 - x0)
}
