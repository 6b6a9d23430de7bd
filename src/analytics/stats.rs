//! Descriptive statistics over per-record consumption values.

use serde::Serialize;

/// Distribution summary of the per-record consumption amounts in a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Distribution {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: u64,
    pub max: u64,
    pub samples: usize,
}

impl Distribution {
    /// Summarize a set of values. Returns `None` when empty.
    pub fn from_values(values: &[u64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let floats: Vec<f64> = values.iter().map(|&v| v as f64).collect();
        let mean = mean(&floats);
        Some(Self {
            mean,
            median: median(&floats),
            std_dev: sample_std_dev(&floats, mean),
            min: *values.iter().min().unwrap_or(&0),
            max: *values.iter().max().unwrap_or(&0),
            samples: values.len(),
        })
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Sample standard deviation (n-1 denominator). Zero for fewer than two
/// samples.
pub fn sample_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt()
}
