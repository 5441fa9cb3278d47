use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::common::stage_flow::Stage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetric {
    pub job_name: String,
    pub stage: Stage,
    pub attempt: u32,
    pub start_time: u64, // milliseconds since epoch
    pub latency_ms: u64,
    pub success: bool,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub total_stage_runs: usize,
    pub successful_stage_runs: usize,
    pub failed_stage_runs: usize,
    pub failure_rate: f64,
    /// Stage runs beyond the first attempt
    pub retries: usize,

    // Latency statistics over successful runs (milliseconds)
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    pub latency_avg_ms: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,

    // Runs per stage name
    pub stage_distribution: HashMap<String, usize>,

    // Failure reasons breakdown
    pub failure_reasons: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct JobMetrics {
    start_time: Instant,
    runs: Vec<StageMetric>,
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl JobMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            runs: Vec::new(),
        }
    }

    pub fn record_stage(
        &mut self,
        job_name: &str,
        stage: Stage,
        attempt: u32,
        latency: Duration,
        failure_reason: Option<String>,
    ) {
        let start_time = chrono::Utc::now().timestamp_millis() as u64;

        self.runs.push(StageMetric {
            job_name: job_name.to_string(),
            stage,
            attempt,
            start_time,
            latency_ms: latency.as_millis() as u64,
            success: failure_reason.is_none(),
            failure_reason,
        });
    }

    pub fn runs(&self) -> &[StageMetric] {
        &self.runs
    }

    pub fn aggregate(&self) -> AggregatedStats {
        let mut stats = AggregatedStats::default();

        if self.runs.is_empty() {
            return stats;
        }

        stats.total_stage_runs = self.runs.len();
        stats.successful_stage_runs = self.runs.iter().filter(|r| r.success).count();
        stats.failed_stage_runs = stats.total_stage_runs - stats.successful_stage_runs;
        stats.failure_rate =
            (stats.failed_stage_runs as f64 / stats.total_stage_runs as f64) * 100.0;
        stats.retries = self.runs.iter().filter(|r| r.attempt > 1).count();

        let mut latencies: Vec<u64> = self
            .runs
            .iter()
            .filter(|r| r.success)
            .map(|r| r.latency_ms)
            .collect();

        if let (Some(min), Some(max)) = (latencies.iter().min(), latencies.iter().max()) {
            stats.latency_min_ms = *min;
            stats.latency_max_ms = *max;
        }
        if !latencies.is_empty() {
            latencies.sort_unstable();
            stats.latency_avg_ms =
                latencies.iter().sum::<u64>() as f64 / latencies.len() as f64;
            stats.latency_p50_ms = percentile(&latencies, 50.0);
            stats.latency_p95_ms = percentile(&latencies, 95.0);
        }

        for run in &self.runs {
            *stats
                .stage_distribution
                .entry(run.stage.to_string())
                .or_insert(0) += 1;
        }

        for run in self.runs.iter().filter(|r| !r.success) {
            if let Some(reason) = &run.failure_reason {
                *stats.failure_reasons.entry(reason.clone()).or_insert(0) += 1;
            }
        }

        stats
    }

    pub fn export_to_json<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let stats = self.aggregate();

        let output = serde_json::json!({
            "run_duration_secs": self.start_time.elapsed().as_secs(),
            "aggregated_stats": stats,
            "stage_runs": self.runs,
        });

        let json_string = serde_json::to_string_pretty(&output)?;
        let mut file = File::create(path)?;
        file.write_all(json_string.as_bytes())?;

        Ok(())
    }
}

fn percentile(sorted_data: &[u64], percentile: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }

    let index = (percentile / 100.0 * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert_eq!(percentile(&data, 50.0), 5);
        assert_eq!(percentile(&data, 95.0), 10);
        assert_eq!(percentile(&[], 50.0), 0);
    }

    #[test]
    fn test_metrics_aggregation() {
        let mut metrics = JobMetrics::new();

        metrics.record_stage("job", Stage::PidShard, 1, Duration::from_millis(100), None);
        metrics.record_stage(
            "job",
            Stage::IdMatch,
            1,
            Duration::from_millis(150),
            Some("ID_MATCH_FAILED".to_string()),
        );
        metrics.record_stage("job", Stage::IdMatch, 2, Duration::from_millis(300), None);

        let stats = metrics.aggregate();

        assert_eq!(stats.total_stage_runs, 3);
        assert_eq!(stats.successful_stage_runs, 2);
        assert_eq!(stats.failed_stage_runs, 1);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.latency_min_ms, 100);
        assert_eq!(stats.latency_max_ms, 300);
        assert_eq!(stats.stage_distribution.get("ID_MATCH"), Some(&2));
        assert_eq!(stats.failure_reasons.get("ID_MATCH_FAILED"), Some(&1));
    }

    #[test]
    fn test_export_to_json() {
        let mut metrics = JobMetrics::new();
        metrics.record_stage("job", Stage::Aggregate, 1, Duration::from_millis(5), None);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        metrics.export_to_json(&path).unwrap();

        let exported: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(exported["aggregated_stats"]["total_stage_runs"], 1);
        assert_eq!(exported["stage_runs"][0]["stage"], "AGGREGATE");
    }
}
