//! Fan-in of per-platform results and cross-platform comparison.
//!
//! Results arrive independently per platform; the aggregator keeps the
//! newest result per (run, platform) and computes comparisons on
//! demand. Nothing here is persisted: the export document is the
//! hand-off to whatever collaborator wants to archive it.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("no results recorded for run: {0}")]
    RunNotFound(String),
}

/// The single result a platform produces for a run. Exactly one per
/// (run, platform); a platform that never reports is recorded as
/// failed-by-timeout by the coordinator's watchdog, never left
/// missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub success: bool,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl PlatformResult {
    pub fn timed_out(window: chrono::Duration, now: DateTime<Utc>) -> Self {
        Self {
            success: false,
            metrics: BTreeMap::new(),
            error: Some(format!(
                "no report within {}s watchdog window",
                window.num_seconds()
            )),
            completed_at: now,
        }
    }
}

/// A metric present on two platforms, with their difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub metric: String,
    pub platform_a: String,
    pub platform_b: String,
    pub value_a: f64,
    pub value_b: f64,
    pub delta: f64,
}

/// A metric only one platform reported. Reported, not dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpairedMetric {
    pub metric: String,
    pub platform: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessComparison {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub success_rate: f64,
}

/// Derived cross-platform comparison for one run. Recomputed on
/// demand from the recorded `PlatformResult`s, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub results: BTreeMap<String, PlatformResult>,
    pub success: SuccessComparison,
    pub metric_deltas: Vec<MetricDelta>,
    pub unpaired_metrics: Vec<UnpairedMetric>,
}

/// Transportable archive of one run: results plus summary. Field
/// names and nesting round-trip losslessly through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub run_id: String,
    pub exported_at: DateTime<Utc>,
    pub results: BTreeMap<String, PlatformResult>,
    pub summary: ComparisonSummary,
}

pub struct ResultAggregator {
    runs: BTreeMap<String, BTreeMap<String, PlatformResult>>,
    order: VecDeque<String>,
    cap: usize,
}

impl ResultAggregator {
    pub fn new(cap: usize) -> Self {
        Self {
            runs: BTreeMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Record one platform's result. Idempotent per (run, platform):
    /// a duplicate arrival overwrites the previous value.
    pub fn record(&mut self, run_id: &str, platform: &str, result: PlatformResult) {
        if !self.runs.contains_key(run_id) {
            if self.order.len() == self.cap {
                if let Some(evicted) = self.order.pop_front() {
                    debug!(run_id = %evicted, "evicting oldest run from aggregator");
                    self.runs.remove(&evicted);
                }
            }
            self.order.push_back(run_id.to_string());
            self.runs.insert(run_id.to_string(), BTreeMap::new());
        }
        if let Some(results) = self.runs.get_mut(run_id) {
            results.insert(platform.to_string(), result);
        }
    }

    pub fn results(&self, run_id: &str) -> Option<&BTreeMap<String, PlatformResult>> {
        self.runs.get(run_id)
    }

    /// Compute the cross-platform comparison for a run.
    pub fn summarize(&self, run_id: &str) -> Result<ComparisonSummary, AggregateError> {
        let results = self
            .runs
            .get(run_id)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| AggregateError::RunNotFound(run_id.to_string()))?;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (platform, result) in results {
            if result.success {
                succeeded.push(platform.clone());
            } else {
                failed.push(platform.clone());
            }
        }
        let success_rate = succeeded.len() as f64 / results.len() as f64;

        // Group every metric by name, then pair values across
        // platforms. A metric seen on a single platform is unpaired.
        let mut by_metric: BTreeMap<&str, Vec<(&str, f64)>> = BTreeMap::new();
        for (platform, result) in results {
            for (metric, value) in &result.metrics {
                by_metric
                    .entry(metric.as_str())
                    .or_default()
                    .push((platform.as_str(), *value));
            }
        }

        let mut metric_deltas = Vec::new();
        let mut unpaired_metrics = Vec::new();
        for (metric, owners) in by_metric {
            if owners.len() == 1 {
                let (platform, value) = owners[0];
                unpaired_metrics.push(UnpairedMetric {
                    metric: metric.to_string(),
                    platform: platform.to_string(),
                    value,
                });
                continue;
            }
            for i in 0..owners.len() {
                for j in (i + 1)..owners.len() {
                    let (pa, va) = owners[i];
                    let (pb, vb) = owners[j];
                    metric_deltas.push(MetricDelta {
                        metric: metric.to_string(),
                        platform_a: pa.to_string(),
                        platform_b: pb.to_string(),
                        value_a: va,
                        value_b: vb,
                        delta: va - vb,
                    });
                }
            }
        }

        Ok(ComparisonSummary {
            run_id: run_id.to_string(),
            generated_at: Utc::now(),
            results: results.clone(),
            success: SuccessComparison {
                succeeded,
                failed,
                success_rate,
            },
            metric_deltas,
            unpaired_metrics,
        })
    }

    /// Build the transportable archive document for a run.
    pub fn export(&self, run_id: &str) -> Result<ExportDocument, AggregateError> {
        let summary = self.summarize(run_id)?;
        Ok(ExportDocument {
            run_id: run_id.to_string(),
            exported_at: Utc::now(),
            results: summary.results.clone(),
            summary,
        })
    }
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new(32)
    }
}
