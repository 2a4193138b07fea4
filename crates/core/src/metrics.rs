//! # Metrics registry
//!
//! Process-wide gauges and counters, optionally partitioned by one label
//! (for storage metrics the label is the database name). Values live in
//! atomics so recording never blocks; `render()` produces a text exposition
//! in the familiar `name{label="value"} number` format.

use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

struct Family {
    help: String,
    kind: MetricKind,
    label: Option<String>,
    series: DashMap<String, Arc<AtomicU64>>,
}

impl Family {
    fn series(&self, label_value: &str) -> Arc<AtomicU64> {
        if let Some(cell) = self.series.get(label_value) {
            return Arc::clone(&cell);
        }
        let cell = self
            .series
            .entry(label_value.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        Arc::clone(&cell)
    }
}

/// Registry of metric families.
///
/// Cloning is cheap; clones share the same families.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    families: Arc<DashMap<String, Arc<Family>>>,
}

impl MetricsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn family(&self, name: &str, help: &str, kind: MetricKind, label: Option<&str>) -> Arc<Family> {
        let family = self
            .families
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Family {
                    help: help.to_string(),
                    kind,
                    label: label.map(str::to_string),
                    series: DashMap::new(),
                })
            });
        Arc::clone(&family)
    }

    /// Register (or look up) a gauge family partitioned by `label`
    pub fn gauge_vec(&self, name: &str, help: &str, label: &str) -> GaugeVec {
        GaugeVec {
            family: self.family(name, help, MetricKind::Gauge, Some(label)),
        }
    }

    /// Register (or look up) a counter family partitioned by `label`
    pub fn counter_vec(&self, name: &str, help: &str, label: &str) -> CounterVec {
        CounterVec {
            family: self.family(name, help, MetricKind::Counter, Some(label)),
        }
    }

    /// Register (or look up) an unlabeled counter
    pub fn counter(&self, name: &str, help: &str) -> Counter {
        let family = self.family(name, help, MetricKind::Counter, None);
        Counter {
            cell: family.series(""),
        }
    }

    /// Current value of a gauge series, if it has been touched
    pub fn gauge_value(&self, name: &str, label_value: &str) -> Option<f64> {
        let family = self.families.get(name)?;
        let cell = family.series.get(label_value)?;
        Some(f64::from_bits(cell.load(Ordering::Relaxed)))
    }

    /// Current value of a counter series, if it has been touched.
    ///
    /// Unlabeled counters are addressed with an empty label value.
    pub fn counter_value(&self, name: &str, label_value: &str) -> Option<u64> {
        let family = self.families.get(name)?;
        let cell = family.series.get(label_value)?;
        Some(cell.load(Ordering::Relaxed))
    }

    /// Render every family in text exposition format, sorted by name
    pub fn render(&self) -> String {
        let mut names: Vec<String> = self.families.iter().map(|e| e.key().clone()).collect();
        names.sort();

        let mut out = String::new();
        for name in names {
            let Some(family) = self.families.get(&name).map(|f| Arc::clone(&f)) else {
                continue;
            };
            let _ = writeln!(out, "# HELP {} {}", name, family.help);
            let _ = writeln!(out, "# TYPE {} {}", name, family.kind.as_str());

            let mut series: Vec<(String, u64)> = family
                .series
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect();
            series.sort();

            for (label_value, raw) in series {
                let value = match family.kind {
                    MetricKind::Gauge => f64::from_bits(raw).to_string(),
                    MetricKind::Counter => raw.to_string(),
                };
                match &family.label {
                    Some(label) => {
                        let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", name, label, label_value, value);
                    }
                    None => {
                        let _ = writeln!(out, "{} {}", name, value);
                    }
                }
            }
        }
        out
    }
}

/// Gauge family partitioned by one label
#[derive(Clone)]
pub struct GaugeVec {
    family: Arc<Family>,
}

impl GaugeVec {
    /// The gauge for one label value
    pub fn with_label_values(&self, value: &str) -> Gauge {
        Gauge {
            cell: self.family.series(value),
        }
    }
}

/// A value that can go up and down
#[derive(Clone)]
pub struct Gauge {
    cell: Arc<AtomicU64>,
}

impl Gauge {
    /// Set the gauge
    pub fn set(&self, value: f64) {
        self.cell.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Read the gauge
    pub fn get(&self) -> f64 {
        f64::from_bits(self.cell.load(Ordering::Relaxed))
    }
}

/// Counter family partitioned by one label
#[derive(Clone)]
pub struct CounterVec {
    family: Arc<Family>,
}

impl CounterVec {
    /// The counter for one label value
    pub fn with_label_values(&self, value: &str) -> Counter {
        Counter {
            cell: self.family.series(value),
        }
    }
}

/// A monotonically increasing count
#[derive(Clone)]
pub struct Counter {
    cell: Arc<AtomicU64>,
}

impl Counter {
    /// Increment by one
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by `n`
    pub fn inc_by(&self, n: u64) {
        self.cell.fetch_add(n, Ordering::Relaxed);
    }

    /// Read the counter
    pub fn get(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }
}
