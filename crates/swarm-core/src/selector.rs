use rand::Rng;

use crate::error::ConfigError;

/// Floating point slack allowed when checking that weights sum to at most 1.0.
const WEIGHT_EPSILON: f64 = 1e-9;

/// Weighted choice over a fixed, ordered set of entries.
///
/// Each entry owns the half-open interval `[previous_upper, upper)` of `[0, 1)`.
/// Draws that land past the last upper bound fall through to the default entry,
/// or select nothing when there is none.
#[derive(Debug, Clone)]
pub struct WorkloadSelector<T> {
    table: Vec<(f64, T)>,
    default: Option<T>,
}

impl<T> WorkloadSelector<T> {
    /// Build the cumulative table from `(name, weight, entry)` in the given order.
    pub fn new<I>(entries: I, default: Option<T>) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, f64, T)>,
    {
        let mut table = Vec::new();
        let mut cumulative = 0.0;

        for (name, weight, entry) in entries {
            if !weight.is_finite() || weight <= 0.0 || weight > 1.0 {
                return Err(ConfigError::InvalidWeight { name, weight });
            }
            cumulative += weight;
            table.push((cumulative, entry));
        }

        if table.is_empty() {
            return Err(ConfigError::NoOperations);
        }
        if cumulative > 1.0 + WEIGHT_EPSILON {
            return Err(ConfigError::WeightSum { sum: cumulative });
        }

        Ok(Self { table, default })
    }

    /// Entry owning `draw`, which must come from `[0, 1)`.
    pub fn pick(&self, draw: f64) -> Option<&T> {
        self.table
            .iter()
            .find(|(upper, _)| draw < *upper)
            .map(|(_, entry)| entry)
            .or(self.default.as_ref())
    }

    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&T> {
        self.pick(rng.gen::<f64>())
    }

    /// Probability left over for the default entry.
    pub fn residual(&self) -> f64 {
        let total = self.table.last().map(|(upper, _)| *upper).unwrap_or(0.0);
        (1.0 - total).max(0.0)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
