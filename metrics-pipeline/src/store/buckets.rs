use std::sync::Arc;

use crate::error::BuildError;

/// Matches a metric name.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Matcher {
    /// Matches the entire metric name.
    Full(String),

    /// Matches the beginning of the metric name.
    Prefix(String),

    /// Matches the end of the metric name.
    Suffix(String),
}

impl Matcher {
    /// Checks if the given name matches this matcher.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Full(full) => name == full,
            Matcher::Prefix(prefix) => name.starts_with(prefix.as_str()),
            Matcher::Suffix(suffix) => name.ends_with(suffix.as_str()),
        }
    }

    const fn precedence(&self) -> u8 {
        match self {
            Matcher::Full(_) => 0,
            Matcher::Prefix(_) => 1,
            Matcher::Suffix(_) => 2,
        }
    }
}

/// Histogram bucket bounds, configured by metric name.
///
/// Overrides are consulted first: a full match wins over a prefix match, which wins over a suffix match. Among
/// overrides of the same kind, the one added first wins. Names that match no override fall back to the default bounds,
/// and if there are none, histograms for that name track only their count and sum.
#[derive(Clone, Debug, Default)]
pub struct HistogramBuckets {
    default: Option<Arc<[f64]>>,
    overrides: Vec<(Matcher, Arc<[f64]>)>,
}

impl HistogramBuckets {
    /// Creates an empty `HistogramBuckets`, where no histogram is bucketed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bounds used for any histogram without a matching override.
    ///
    /// Values above the last bound are counted only toward the histogram's count, so there is no need for an
    /// infinite bound.
    ///
    /// # Errors
    ///
    /// If `bounds` is empty, not strictly ascending, or contains a non-finite value, an error is returned.
    pub fn with_default(mut self, bounds: &[f64]) -> Result<Self, BuildError> {
        self.default = Some(normalize(bounds)?);
        Ok(self)
    }

    /// Sets the bounds used for histograms whose name matches `matcher`.
    ///
    /// # Errors
    ///
    /// If `bounds` is empty, not strictly ascending, or contains a non-finite value, an error is returned.
    pub fn with_override(mut self, matcher: Matcher, bounds: &[f64]) -> Result<Self, BuildError> {
        let bounds = normalize(bounds)?;
        let position =
            self.overrides.iter().position(|(existing, _)| existing.precedence() > matcher.precedence());
        match position {
            Some(idx) => self.overrides.insert(idx, (matcher, bounds)),
            None => self.overrides.push((matcher, bounds)),
        }
        Ok(self)
    }

    /// Returns the bounds for the given histogram name, if any are configured.
    pub fn bounds_for(&self, name: &str) -> Option<Arc<[f64]>> {
        self.overrides
            .iter()
            .find(|(matcher, _)| matcher.matches(name))
            .map(|(_, bounds)| Arc::clone(bounds))
            .or_else(|| self.default.clone())
    }
}

fn normalize(bounds: &[f64]) -> Result<Arc<[f64]>, BuildError> {
    if bounds.is_empty() {
        return Err(BuildError::InvalidBuckets { reason: "no bounds given".to_string() });
    }
    if let Some(bound) = bounds.iter().find(|b| !b.is_finite()) {
        return Err(BuildError::InvalidBuckets { reason: format!("bound {bound} is not finite") });
    }
    if let Some(pair) = bounds.windows(2).find(|pair| pair[0] >= pair[1]) {
        return Err(BuildError::InvalidBuckets {
            reason: format!("bounds must be strictly ascending, but {} is followed by {}", pair[0], pair[1]),
        });
    }

    Ok(bounds.into())
}

/// Aggregated state of a histogram series.
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramSnapshot {
    count: u64,
    sum: f64,
    bounds: Option<Arc<[f64]>>,
    bucket_counts: Vec<u64>,
}

impl HistogramSnapshot {
    /// Returns the number of observations.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the sum of all observations.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Returns the mean observation, or `None` if nothing was observed.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Returns the configured upper bounds, in ascending order.
    pub fn bounds(&self) -> &[f64] {
        self.bounds.as_deref().unwrap_or(&[])
    }

    /// Returns the per-bucket counts, one for each bound.
    ///
    /// Each observation lands in the first bucket whose bound is greater than or equal to it, so counts are not
    /// cumulative.
    pub fn bucket_counts(&self) -> &[u64] {
        &self.bucket_counts
    }

    /// Returns `(bound, count)` pairs.
    pub fn buckets(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.bounds().iter().copied().zip(self.bucket_counts.iter().copied())
    }

    /// Returns the number of observations greater than every bound.
    pub fn overflow(&self) -> u64 {
        self.count - self.bucket_counts.iter().sum::<u64>()
    }
}

#[derive(Debug)]
pub(crate) struct HistogramState {
    count: u64,
    sum: f64,
    bounds: Option<Arc<[f64]>>,
    bucket_counts: Vec<u64>,
}

impl HistogramState {
    pub(crate) fn new(bounds: Option<Arc<[f64]>>) -> Self {
        let bucket_counts = vec![0; bounds.as_ref().map_or(0, |b| b.len())];
        Self { count: 0, sum: 0.0, bounds, bucket_counts }
    }

    pub(crate) fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;

        if let Some(bounds) = &self.bounds {
            if let Some(idx) = bounds.iter().position(|bound| value <= *bound) {
                self.bucket_counts[idx] += 1;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count,
            sum: self.sum,
            bounds: self.bounds.clone(),
            bucket_counts: self.bucket_counts.clone(),
        }
    }
}
