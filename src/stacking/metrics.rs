//! Per-epoch running averages of named metrics.

use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricStats {
    pub sum: f64,
    pub count: usize,
}

impl MetricStats {
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Accumulates one value per batch for each metric, in insertion order.
///
/// A monitor belongs to one epoch; start each epoch with a new one.
#[derive(Debug, Clone)]
pub struct MetricMonitor {
    metrics: Vec<(String, MetricStats)>,
    precision: usize,
}

impl Default for MetricMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricMonitor {
    pub fn new() -> Self {
        Self::with_precision(3)
    }

    pub fn with_precision(precision: usize) -> Self {
        Self {
            metrics: Vec::new(),
            precision,
        }
    }

    pub fn update(&mut self, name: &str, value: f64) {
        match self.metrics.iter_mut().find(|(n, _)| n == name) {
            Some((_, stats)) => {
                stats.sum += value;
                stats.count += 1;
            }
            None => self.metrics.push((name.to_string(), MetricStats { sum: value, count: 1 })),
        }
    }

    pub fn get(&self, name: &str) -> Option<MetricStats> {
        self.metrics.iter().find(|(n, _)| n == name).map(|(_, s)| *s)
    }

    /// Running average, or zero for a metric never updated.
    pub fn avg(&self, name: &str) -> f64 {
        self.get(name).map_or(0.0, |s| s.avg())
    }
}

impl fmt::Display for MetricMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (name, stats)) in self.metrics.iter().enumerate() {
            if idx > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{name}: {:.*}", self.precision, stats.avg())?;
        }
        Ok(())
    }
}
