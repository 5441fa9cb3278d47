//! # Job Runner
//!
//! Drives a two-party job (publisher + partner) through every stage using
//! only the [`ComputationClient`] operations. This is where retry policy
//! lives; the clients themselves never retry.
//!
//! ## Job Workflow
//!
//! 1. **Create**: Create (or resume) both instances
//! 2. **Run**: For each pending stage, run it on the publisher, hand the
//!    publisher's server ips to the partner on joint stages, then run it on
//!    the partner
//! 3. **Poll**: Poll both instances until the stage completes or fails
//! 4. **Retry**: Re-run a failed stage up to `max_stage_retries` times
//! 5. **Validate**: Check the publisher's results once every stage is done

use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::metrics::JobMetrics;
use crate::client::{ClientFactory, ComputationClient, InstanceCreationArgs, PartyRole};
use crate::common::config::{CoordinatorSection, JobConfig};
use crate::common::error::{CoordinatorError, Result};
use crate::common::stage_flow::{InstanceStatus, Stage};

/// Polling and retry parameters.
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub stage_timeout: Duration,
    pub max_stage_retries: u32,
}

impl From<&CoordinatorSection> for RunnerConfig {
    fn from(section: &CoordinatorSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            stage_timeout: Duration::from_secs(section.stage_timeout_secs),
            max_stage_retries: section.max_stage_retries,
        }
    }
}

/// One side of a job: the client that drives it and its creation args.
pub struct Party {
    pub client: Arc<dyn ComputationClient>,
    pub args: InstanceCreationArgs,
}

pub struct Job {
    pub name: String,
    pub publisher: Party,
    pub partner: Party,
    pub expected_result_path: Option<PathBuf>,
}

impl Job {
    /// Build a job from config, one client per party.
    ///
    /// # Errors
    /// Fails when a client cannot be constructed, e.g. no credential.
    pub fn from_config(config: &JobConfig, factory: &ClientFactory) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            publisher: Party {
                client: factory.build(PartyRole::Publisher)?,
                args: config.publisher.clone(),
            },
            partner: Party {
                client: factory.build(PartyRole::Partner)?,
                args: config.partner.clone(),
            },
            expected_result_path: config.expected_result_path.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every stage completed and the results validated
    Succeeded,
    /// Every stage completed but the results did not match
    ResultsMismatch,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub name: String,
    pub publisher_instance: Option<String>,
    pub partner_instance: Option<String>,
    pub outcome: JobOutcome,
}

/// Instance ids of both parties of a running job.
struct JobInstances {
    publisher: String,
    partner: String,
}

#[derive(Clone)]
pub struct JobRunner {
    config: RunnerConfig,
    metrics: Option<Arc<Mutex<JobMetrics>>>,
}

impl JobRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Mutex<JobMetrics>>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run many jobs concurrently on the current runtime.
    ///
    /// Summaries come back in the order the jobs were given. A job whose task
    /// panicked keeps its slot with a `Failed` outcome.
    pub async fn run_jobs(&self, jobs: Vec<Job>) -> Vec<JobSummary> {
        let handles: Vec<(String, JoinHandle<JobSummary>)> = jobs
            .into_iter()
            .map(|job| {
                let runner = self.clone();
                let name = job.name.clone();
                (name, tokio::spawn(async move { runner.run_job(&job).await }))
            })
            .collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let summary = match handle.await {
                Ok(summary) => summary,
                Err(e) => {
                    error!("❌ Job '{}' task panicked: {}", name, e);
                    JobSummary {
                        name,
                        publisher_instance: None,
                        partner_instance: None,
                        outcome: JobOutcome::Failed("panicked".to_string()),
                    }
                }
            };
            summaries.push(summary);
        }

        summaries
    }

    /// Drive one job to completion and summarize the outcome.
    pub async fn run_job(&self, job: &Job) -> JobSummary {
        info!("🚀 Starting job '{}'", job.name);

        let mut summary = JobSummary {
            name: job.name.clone(),
            publisher_instance: None,
            partner_instance: None,
            outcome: JobOutcome::Failed("not started".to_string()),
        };

        let instances = match self.create_instances(job).await {
            Ok(instances) => instances,
            Err(e) => {
                error!("❌ Job '{}' could not create instances: {}", job.name, e);
                summary.outcome = JobOutcome::Failed(e.to_string());
                return summary;
            }
        };
        summary.publisher_instance = Some(instances.publisher.clone());
        summary.partner_instance = Some(instances.partner.clone());

        summary.outcome = match self.drive(job, &instances).await {
            Ok(true) => {
                info!("✅ Job '{}' finished and validated", job.name);
                JobOutcome::Succeeded
            }
            Ok(false) => {
                warn!("❌ Job '{}' finished with mismatching results", job.name);
                JobOutcome::ResultsMismatch
            }
            Err(e) => {
                error!("❌ Job '{}' failed: {}", job.name, e);
                JobOutcome::Failed(e.to_string())
            }
        };

        summary
    }

    async fn create_instances(&self, job: &Job) -> Result<JobInstances> {
        let publisher = job.publisher.client.create_instance(&job.publisher.args).await?;
        let partner = job.partner.client.create_instance(&job.partner.args).await?;
        info!(
            "Job '{}': publisher instance {}, partner instance {}",
            job.name, publisher, partner
        );
        Ok(JobInstances { publisher, partner })
    }

    async fn drive(&self, job: &Job, instances: &JobInstances) -> Result<bool> {
        // Resume from the party that is furthest behind; the other one
        // absorbs the stages it already finished as duplicates.
        let publisher = job.publisher.client.update_instance(&instances.publisher).await?;
        let partner = job.partner.client.update_instance(&instances.partner).await?;
        ensure_not_failed(&instances.publisher, publisher.status)?;
        ensure_not_failed(&instances.partner, partner.status)?;
        let mut next = resume_stage(publisher.status, partner.status);

        while let Some(stage) = next {
            self.run_stage_with_retries(job, instances, stage).await?;
            next = stage.next();
        }

        job.publisher
            .client
            .validate_results(&instances.publisher, job.expected_result_path.as_deref())
            .await
    }

    async fn run_stage_with_retries(
        &self,
        job: &Job,
        instances: &JobInstances,
        stage: Stage,
    ) -> Result<()> {
        let max_attempts = self.config.max_stage_retries + 1;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                info!(
                    "🔄 Job '{}' retry attempt {}/{} for stage {}",
                    job.name, attempt, max_attempts, stage
                );
                sleep(self.config.poll_interval).await;
            }

            let started = Instant::now();
            let failure = self.attempt_stage(job, instances, stage).await?;
            self.record(&job.name, stage, attempt, started.elapsed(), failure.clone());

            match failure {
                None => {
                    info!("✅ Job '{}' completed stage {}", job.name, stage);
                    return Ok(());
                }
                Some(reason) => warn!(
                    "Job '{}' stage {} failed on attempt {}/{}: {}",
                    job.name, stage, attempt, max_attempts, reason
                ),
            }
        }

        Err(CoordinatorError::StageFailed {
            stage,
            attempts: max_attempts,
        })
    }

    /// Run one attempt of `stage` on both parties.
    ///
    /// Returns `Ok(None)` on success and `Ok(Some(reason))` when either party
    /// reported the stage as failed. Client errors abort the job.
    async fn attempt_stage(
        &self,
        job: &Job,
        instances: &JobInstances,
        stage: Stage,
    ) -> Result<Option<String>> {
        let publisher = job.publisher.client.as_ref();
        let partner = job.partner.client.as_ref();

        publisher
            .run_stage(&instances.publisher, Some(stage), None)
            .await?;

        let server_ips = if stage.is_joint() {
            match self.wait_for_server_ips(publisher, &instances.publisher, stage).await? {
                Some(ips) => Some(ips),
                None => return Ok(Some(format!("publisher {}", InstanceStatus::StageFailed(stage)))),
            }
        } else {
            None
        };

        partner
            .run_stage(&instances.partner, Some(stage), server_ips.as_deref())
            .await?;

        let (publisher_done, partner_done) = tokio::try_join!(
            self.wait_for_stage(publisher, &instances.publisher, stage),
            self.wait_for_stage(partner, &instances.partner, stage),
        )?;

        let failure = match (publisher_done, partner_done) {
            (true, true) => None,
            (false, _) => Some(format!("publisher {}", InstanceStatus::StageFailed(stage))),
            (true, false) => Some(format!("partner {}", InstanceStatus::StageFailed(stage))),
        };
        Ok(failure)
    }

    /// Poll the publisher until it reports server ips for a joint stage.
    ///
    /// `Ok(None)` means the publisher failed the stage before reporting any.
    async fn wait_for_server_ips(
        &self,
        client: &dyn ComputationClient,
        instance_id: &str,
        stage: Stage,
    ) -> Result<Option<Vec<String>>> {
        tokio::time::timeout(
            self.config.stage_timeout,
            self.poll_server_ips(client, instance_id, stage),
        )
        .await
        .map_err(|_| CoordinatorError::StageTimeout {
            instance_id: instance_id.to_string(),
            stage,
        })?
    }

    async fn poll_server_ips(
        &self,
        client: &dyn ComputationClient,
        instance_id: &str,
        stage: Stage,
    ) -> Result<Option<Vec<String>>> {
        loop {
            let state = client.update_instance(instance_id).await?;
            ensure_not_failed(instance_id, state.status)?;
            if state.status == InstanceStatus::StageFailed(stage) {
                return Ok(None);
            }
            // Ips reported before the publisher reaches this stage belong to
            // an earlier joint stage.
            if reached_stage(state.status, stage) && !state.server_ips.is_empty() {
                return Ok(Some(state.server_ips));
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Poll until `stage` is done (`true`) or failed (`false`).
    async fn wait_for_stage(
        &self,
        client: &dyn ComputationClient,
        instance_id: &str,
        stage: Stage,
    ) -> Result<bool> {
        tokio::time::timeout(
            self.config.stage_timeout,
            self.poll_stage(client, instance_id, stage),
        )
        .await
        .map_err(|_| CoordinatorError::StageTimeout {
            instance_id: instance_id.to_string(),
            stage,
        })?
    }

    async fn poll_stage(
        &self,
        client: &dyn ComputationClient,
        instance_id: &str,
        stage: Stage,
    ) -> Result<bool> {
        loop {
            let state = client.update_instance(instance_id).await?;
            ensure_not_failed(instance_id, state.status)?;
            if let Some(done) = stage_outcome(state.status, stage) {
                return Ok(done);
            }
            sleep(self.config.poll_interval).await;
        }
    }

    fn record(
        &self,
        job_name: &str,
        stage: Stage,
        attempt: u32,
        latency: Duration,
        failure: Option<String>,
    ) {
        if let Some(metrics) = &self.metrics {
            match metrics.lock() {
                Ok(mut metrics) => metrics.record_stage(job_name, stage, attempt, latency, failure),
                Err(e) => error!("❌ Metrics lock poisoned: {}", e),
            }
        }
    }
}

/// A `FAILED` instance ends the job; retrying cannot bring it back.
fn ensure_not_failed(instance_id: &str, status: InstanceStatus) -> Result<()> {
    if status == InstanceStatus::Failed {
        return Err(CoordinatorError::TerminalInstance {
            instance_id: instance_id.to_string(),
            status: status.to_string(),
        });
    }
    Ok(())
}

/// First stage either party still has to run; `None` once both are done.
fn resume_stage(publisher: InstanceStatus, partner: InstanceStatus) -> Option<Stage> {
    [publisher.pending_stage(), partner.pending_stage()]
        .into_iter()
        .flatten()
        .min()
}

/// Whether `status` shows the instance at `stage` or past it.
fn reached_stage(status: InstanceStatus, stage: Stage) -> bool {
    match status {
        InstanceStatus::Created | InstanceStatus::Failed => false,
        InstanceStatus::Completed => true,
        InstanceStatus::Started(s) | InstanceStatus::StageCompleted(s) => s >= stage,
        InstanceStatus::StageFailed(s) => s > stage,
    }
}

/// Whether `status` shows `stage` as finished; `None` while still undecided.
fn stage_outcome(status: InstanceStatus, stage: Stage) -> Option<bool> {
    match status {
        InstanceStatus::Completed => Some(true),
        InstanceStatus::StageCompleted(s) if s >= stage => Some(true),
        InstanceStatus::Started(s) | InstanceStatus::StageFailed(s) if s > stage => Some(true),
        InstanceStatus::StageFailed(s) if s == stage => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_outcome() {
        use InstanceStatus::*;

        assert_eq!(stage_outcome(Created, Stage::PidShard), None);
        assert_eq!(stage_outcome(Started(Stage::PidShard), Stage::PidShard), None);
        assert_eq!(stage_outcome(StageCompleted(Stage::PidShard), Stage::PidShard), Some(true));
        assert_eq!(stage_outcome(StageFailed(Stage::PidShard), Stage::PidShard), Some(false));
        assert_eq!(stage_outcome(Started(Stage::IdMatch), Stage::PidShard), Some(true));
        assert_eq!(stage_outcome(StageCompleted(Stage::PidShard), Stage::IdMatch), None);
        assert_eq!(stage_outcome(Completed, Stage::Aggregate), Some(true));
    }

    #[test]
    fn test_resume_stage_takes_the_party_behind() {
        use InstanceStatus::*;

        assert_eq!(
            resume_stage(StageCompleted(Stage::PidShard), Created),
            Some(Stage::PidShard)
        );
        assert_eq!(
            resume_stage(StageCompleted(Stage::PidPrepare), StageCompleted(Stage::PidShard)),
            Some(Stage::PidPrepare)
        );
        assert_eq!(
            resume_stage(StageFailed(Stage::IdMatch), StageCompleted(Stage::ComputeMetrics)),
            Some(Stage::IdMatch)
        );
        assert_eq!(resume_stage(Completed, StageCompleted(Stage::IdMatch)), Some(Stage::ComputeMetrics));
        assert_eq!(resume_stage(Completed, Completed), None);
    }

    #[test]
    fn test_reached_stage() {
        use InstanceStatus::*;

        assert!(!reached_stage(Created, Stage::IdMatch));
        assert!(!reached_stage(StageCompleted(Stage::IdMatch), Stage::ComputeMetrics));
        assert!(reached_stage(Started(Stage::ComputeMetrics), Stage::ComputeMetrics));
        assert!(reached_stage(StageCompleted(Stage::ComputeMetrics), Stage::ComputeMetrics));
        assert!(!reached_stage(StageFailed(Stage::ComputeMetrics), Stage::ComputeMetrics));
        assert!(reached_stage(Completed, Stage::IdMatch));
        assert!(!reached_stage(Failed, Stage::IdMatch));
    }

    #[test]
    fn test_failed_instance_is_an_error() {
        assert!(ensure_not_failed("i", InstanceStatus::StageFailed(Stage::IdMatch)).is_ok());
        assert!(matches!(
            ensure_not_failed("i", InstanceStatus::Failed),
            Err(CoordinatorError::TerminalInstance { .. })
        ));
    }

    #[test]
    fn test_runner_config_from_section() {
        let section: CoordinatorSection = toml::from_str(
            r#"
backend = "simulator"
poll_interval_ms = 25
stage_timeout_secs = 3
"#,
        )
        .unwrap();
        let config = RunnerConfig::from(&section);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.stage_timeout, Duration::from_secs(3));
        assert_eq!(config.max_stage_retries, 2);
    }
}
