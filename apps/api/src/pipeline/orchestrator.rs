//! Pipeline Orchestrator: runs each job as one background task and publishes its
//! state for pollers.
//!
//! Each job's state lives in a `tokio::sync::watch` channel. The job task owns the
//! only `Sender` (wrapped in `JobWriter`), the registry keeps a `Receiver`, and every
//! update replaces the whole `Job` value, so a poller always sees a complete snapshot.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::pipeline::job::{
    Job, JobErrorKind, JobFailure, JobId, JobResult, JobStatus, Stage, StageError, StepResult,
    StepStatus,
};
use crate::pipeline::stages::{JobInput, PipelineStages};

pub struct Orchestrator {
    stages: Arc<dyn PipelineStages>,
    deadline: Duration,
    jobs: DashMap<JobId, watch::Receiver<Job>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(stages: Arc<dyn PipelineStages>, deadline: Duration) -> Self {
        Self {
            stages,
            deadline,
            jobs: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers a Pending job and spawns its task. Returns without waiting.
    pub fn submit(&self, input: JobInput) -> JobId {
        let id = JobId::generate();
        let (tx, rx) = watch::channel(Job::pending(id.clone()));
        self.jobs.insert(id.clone(), rx);

        let writer = JobWriter { tx, started: None };
        let stages = self.stages.clone();
        let cancel = self.shutdown.child_token();
        let deadline = self.deadline;
        let span = info_span!("job", job_id = %id);
        tokio::spawn(
            async move { run_job(stages, writer, input, cancel, deadline).await }.instrument(span),
        );

        info!("Submitted job {id}");
        id
    }

    /// Snapshot of a job, or `None` for an unknown id.
    pub fn get_status(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|rx| rx.borrow().clone())
    }

    /// Snapshots of every known job, newest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|rx| rx.borrow().clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Resolves once the job is Completed or Failed.
    pub async fn wait_for_terminal(&self, id: &JobId) -> Option<Job> {
        // Clone the receiver so no registry guard is held across the await.
        let mut rx = self.jobs.get(id).map(|rx| rx.value().clone())?;
        let waited = rx
            .wait_for(|job| job.status.is_terminal())
            .await
            .map(|job| job.clone());
        match waited {
            Ok(job) => Some(job),
            Err(_) => Some(rx.borrow().clone()),
        }
    }

    /// Cancels every running job. Used on server shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits up to `grace` for every job to reach a terminal state. Returns how
    /// many were still unsettled when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> usize {
        let ids: Vec<JobId> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        let settle = async {
            for id in &ids {
                self.wait_for_terminal(id).await;
            }
        };
        if tokio::time::timeout(grace, settle).await.is_err() {
            warn!("Drain grace period of {grace:?} elapsed with jobs still running");
        }
        self.jobs
            .iter()
            .filter(|rx| !rx.borrow().status.is_terminal())
            .count()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Job task
// ────────────────────────────────────────────────────────────────────────────

/// Sole publisher of one job's state.
struct JobWriter {
    tx: watch::Sender<Job>,
    started: Option<Instant>,
}

impl JobWriter {
    fn start(&mut self, first: Stage) -> Instant {
        let started = Instant::now();
        self.started = Some(started);
        self.tx.send_modify(|job| {
            job.status = JobStatus::Running;
            job.current_step = Some(first);
            job.started_at = Some(Utc::now());
        });
        started
    }

    fn begin_step(&self, stage: Stage) {
        self.tx.send_modify(|job| job.current_step = Some(stage));
    }

    fn finish_step(&self, stage: Stage, elapsed: Duration, error: Option<String>) {
        self.tx.send_modify(|job| {
            job.steps.push(StepResult {
                stage,
                status: if error.is_some() {
                    StepStatus::Failed
                } else {
                    StepStatus::Completed
                },
                duration_ms: elapsed.as_millis() as u64,
                error,
            })
        });
    }

    fn complete(&self, result: JobResult, elapsed: Duration) {
        self.tx.send_modify(|job| {
            job.status = JobStatus::Completed;
            job.current_step = None;
            job.result = Some(result);
            job.completed_at = Some(Utc::now());
            job.total_duration_ms = Some(elapsed.as_millis() as u64);
        });
    }

    fn fail(&self, failure: &JobFailure, elapsed: Duration) {
        self.tx.send_modify(|job| {
            job.status = JobStatus::Failed;
            job.current_step = Some(failure.stage());
            job.error = Some(failure.to_string());
            job.error_kind = Some(failure.kind());
            job.completed_at = Some(Utc::now());
            job.total_duration_ms = Some(elapsed.as_millis() as u64);
        });
    }
}

impl Drop for JobWriter {
    /// A job task that ends without reaching a terminal state (a panicking stage)
    /// still leaves pollers a Failed job.
    fn drop(&mut self) {
        if self.tx.borrow().status.is_terminal() {
            return;
        }
        let elapsed_ms = self.started.map(|s| s.elapsed().as_millis() as u64);
        self.tx.send_modify(|job| {
            let stage = job.current_step.unwrap_or(Stage::Extract);
            if job.steps.last().map(|s| s.stage) != Some(stage) {
                job.steps.push(StepResult {
                    stage,
                    status: StepStatus::Failed,
                    duration_ms: 0,
                    error: Some("stage aborted".to_string()),
                });
            }
            job.status = JobStatus::Failed;
            job.current_step = Some(stage);
            job.error = Some(format!("job task ended unexpectedly during {stage} stage"));
            job.error_kind = Some(JobErrorKind::StageFailed);
            job.completed_at = Some(Utc::now());
            job.total_duration_ms = elapsed_ms;
        });
    }
}

async fn run_job(
    stages: Arc<dyn PipelineStages>,
    mut writer: JobWriter,
    input: JobInput,
    cancel: CancellationToken,
    deadline: Duration,
) {
    let started = writer.start(Stage::ALL[0]);

    let id = writer.tx.borrow().id.clone();
    let mut ctx = StepContext {
        writer: &writer,
        cancel: &cancel,
        deadline,
        deadline_at: started.checked_add(deadline),
    };
    let outcome = run_stages(stages.as_ref(), &id, &input, &mut ctx).await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(result) => {
            info!(
                "Job {id} completed in {}ms (score {})",
                elapsed.as_millis(),
                result.score
            );
            writer.complete(result, elapsed);
        }
        Err(failure) => {
            error!("Job {id} failed: {failure}");
            writer.fail(&failure, elapsed);
        }
    }
}

async fn run_stages(
    stages: &dyn PipelineStages,
    id: &JobId,
    input: &JobInput,
    ctx: &mut StepContext<'_>,
) -> Result<JobResult, JobFailure> {
    let cancel = ctx.cancel.clone();

    let posting = ctx
        .step(Stage::Extract, stages.extract(&input.posting_text, &cancel))
        .await?;
    let analysis = ctx
        .step(Stage::Analyze, stages.analyze(posting, &input.profile, &cancel))
        .await?;
    let content = ctx
        .step(Stage::Generate, stages.generate(&analysis, &cancel))
        .await?;
    ctx.step(Stage::Render, stages.render(id, &analysis, &content, &cancel))
        .await
}

async fn deadline_elapsed(deadline_at: Option<Instant>) {
    match deadline_at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct StepContext<'a> {
    writer: &'a JobWriter,
    cancel: &'a CancellationToken,
    deadline: Duration,
    /// `None` when the deadline lies beyond what `Instant` can represent.
    deadline_at: Option<Instant>,
}

impl StepContext<'_> {
    /// Runs one stage, racing it against the job deadline and cancellation, and
    /// appends its StepResult. A losing stage future is dropped mid-flight.
    async fn step<T, F>(&mut self, stage: Stage, fut: F) -> Result<T, JobFailure>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        self.writer.begin_step(stage);
        info!("Starting {stage} stage");
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = deadline_elapsed(self.deadline_at) => {
                self.cancel.cancel();
                Err(JobFailure::DeadlineExceeded { stage, deadline: self.deadline })
            }
            _ = self.cancel.cancelled() => Err(JobFailure::Cancelled { stage }),
            result = fut => result.map_err(JobFailure::from),
        };
        let elapsed = started.elapsed();

        match &outcome {
            Ok(_) => info!("{stage} stage completed in {}ms", elapsed.as_millis()),
            Err(failure) => warn!("{stage} stage failed after {}ms: {failure}", elapsed.as_millis()),
        }
        self.writer.finish_step(
            stage,
            elapsed,
            outcome.as_ref().err().map(|f| f.to_string()),
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::generation::analyze::Analysis;
    use crate::generation::extract::ExtractedPosting;
    use crate::generation::generate::fixtures::{analysis, bullets_json, NARRATIVE_JSON};
    use crate::generation::generate::GeneratedContent;
    use crate::llm_client::testing::{client_with, test_config, Scripted, ScriptedBackend};
    use crate::llm_client::InferenceError;
    use crate::models::profile::{sample_entry, UserProfile};
    use crate::pipeline::stages::LlmPipeline;
    use crate::storage::LocalArtifactStore;

    enum Behavior {
        Fail(StageError),
        Hang,
        Panic,
    }

    /// Stages with fixed per-stage latency and one configurable misbehaving stage.
    struct FakeStages {
        delay: Duration,
        target: Option<(Stage, Behavior)>,
        calls: [AtomicUsize; 4],
    }

    impl FakeStages {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                target: None,
                calls: Default::default(),
            }
        }

        fn with(mut self, stage: Stage, behavior: Behavior) -> Self {
            self.target = Some((stage, behavior));
            self
        }

        fn calls(&self, stage: Stage) -> usize {
            let idx = Stage::ALL.iter().position(|s| *s == stage).unwrap();
            self.calls[idx].load(Ordering::SeqCst)
        }

        async fn run(&self, stage: Stage) -> Result<(), StageError> {
            let idx = Stage::ALL.iter().position(|s| *s == stage).unwrap();
            self.calls[idx].fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.target {
                Some((s, behavior)) if *s == stage => match behavior {
                    Behavior::Fail(e) => Err(e.clone()),
                    Behavior::Hang => std::future::pending().await,
                    Behavior::Panic => panic!("stage exploded"),
                },
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl PipelineStages for FakeStages {
        async fn extract(
            &self,
            _posting_text: &str,
            _cancel: &CancellationToken,
        ) -> Result<ExtractedPosting, StageError> {
            self.run(Stage::Extract).await?;
            Ok(analysis().posting)
        }

        async fn analyze(
            &self,
            _posting: ExtractedPosting,
            _profile: &UserProfile,
            _cancel: &CancellationToken,
        ) -> Result<Analysis, StageError> {
            self.run(Stage::Analyze).await?;
            Ok(analysis())
        }

        async fn generate(
            &self,
            _analysis: &Analysis,
            _cancel: &CancellationToken,
        ) -> Result<GeneratedContent, StageError> {
            self.run(Stage::Generate).await?;
            Ok(GeneratedContent {
                bullets: vec![],
                summary: "summary".to_string(),
                cover_letter: "letter".to_string(),
            })
        }

        async fn render(
            &self,
            _job_id: &JobId,
            analysis: &Analysis,
            content: &GeneratedContent,
            _cancel: &CancellationToken,
        ) -> Result<JobResult, StageError> {
            self.run(Stage::Render).await?;
            Ok(JobResult {
                title: analysis.posting.title.clone(),
                company: analysis.posting.company.clone(),
                score: analysis.score,
                summary: content.summary.clone(),
                bullet_count: content.bullets.len(),
                output_files: vec![],
            })
        }
    }

    fn input() -> JobInput {
        JobInput {
            posting_text: "Rust engineer wanted".to_string(),
            profile: UserProfile {
                user_id: Uuid::new_v4(),
                entries: vec![sample_entry("experience", &["rust"], "Rust")],
            },
        }
    }

    fn orchestrator(stages: Arc<FakeStages>) -> Orchestrator {
        Orchestrator::new(stages, Duration::from_secs(900))
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_successful_stages_complete_job() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(10)));
        let orch = orchestrator(stages.clone());
        let id = orch.submit(input());

        let job = orch.wait_for_terminal(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.current_step, None);
        assert!(job.error.is_none());
        assert_eq!(job.result.as_ref().unwrap().title, "Rust Engineer");
        let stages_run: Vec<_> = job.steps.iter().map(|s| s.stage).collect();
        assert_eq!(stages_run, Stage::ALL.to_vec());
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Completed));
        for stage in Stage::ALL {
            assert_eq!(stages.calls(stage), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_duration_is_sum_of_stage_latencies() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(10)));
        let orch = orchestrator(stages);
        let id = orch.submit(input());

        let job = orch.wait_for_terminal(&id).await.unwrap();
        let total = job.total_duration_ms.unwrap();
        assert!((40..50).contains(&total), "total was {total}ms");
        assert!(job.steps.iter().all(|s| (10..15).contains(&s.duration_ms)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_at_each_stage_stops_the_pipeline() {
        for (n, failing) in Stage::ALL.into_iter().enumerate() {
            let stages = Arc::new(
                FakeStages::new(Duration::from_millis(1))
                    .with(failing, Behavior::Fail(StageError::validation(failing, "boom"))),
            );
            let orch = orchestrator(stages.clone());
            let id = orch.submit(input());

            let job = orch.wait_for_terminal(&id).await.unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.current_step, Some(failing));
            assert_eq!(job.error_kind, Some(JobErrorKind::StageFailed));
            assert!(job.error.as_deref().unwrap().contains("boom"));
            assert!(job.result.is_none());
            assert_eq!(job.steps.len(), n + 1);
            assert_eq!(job.steps[n].status, StepStatus::Failed);
            assert!(job.steps[..n].iter().all(|s| s.status == StepStatus::Completed));

            for (i, stage) in Stage::ALL.into_iter().enumerate() {
                let expected = usize::from(i <= n);
                assert_eq!(stages.calls(stage), expected, "{stage} after failure at {failing}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_in_analyze_fails_job() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(1)).with(
            Stage::Analyze,
            Behavior::Fail(StageError::new(
                Stage::Analyze,
                InferenceError::MalformedResponse("expected value at line 1".into()),
            )),
        ));
        let orch = orchestrator(stages.clone());
        let id = orch.submit(input());

        let job = orch.wait_for_terminal(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind, Some(JobErrorKind::MalformedResponse));
        assert_eq!(job.current_step, Some(Stage::Analyze));
        assert_eq!(job.steps[0].status, StepStatus::Completed);
        assert_eq!(job.steps[1].stage, Stage::Analyze);
        assert_eq!(job.steps[1].status, StepStatus::Failed);
        assert_eq!(stages.calls(Stage::Generate), 0);
        assert_eq!(stages.calls(Stage::Render), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_hanging_stage() {
        let stages =
            Arc::new(FakeStages::new(Duration::from_millis(10)).with(Stage::Generate, Behavior::Hang));
        let orch = Orchestrator::new(stages.clone(), Duration::from_millis(100));
        let id = orch.submit(input());

        let job = orch.wait_for_terminal(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind, Some(JobErrorKind::DeadlineExceeded));
        assert_eq!(job.current_step, Some(Stage::Generate));
        let last = job.steps.last().unwrap();
        assert_eq!(last.stage, Stage::Generate);
        assert_eq!(last.status, StepStatus::Failed);
        assert!(last.error.as_deref().unwrap().contains("deadline"));
        assert_eq!(stages.calls(Stage::Render), 0);
        let total = job.total_duration_ms.unwrap();
        assert!((100..110).contains(&total), "total was {total}ms");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_running_job() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(10)).with(Stage::Extract, Behavior::Hang));
        let orch = orchestrator(stages);
        let id = orch.submit(input());
        tokio::time::sleep(Duration::from_millis(20)).await;
        orch.shutdown();

        let job = orch.wait_for_terminal(&id).await.unwrap();
        assert_eq!(job.error_kind, Some(JobErrorKind::Cancelled));
        assert_eq!(job.current_step, Some(Stage::Extract));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_after_shutdown_settles_running_jobs() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(10)).with(Stage::Analyze, Behavior::Hang));
        let orch = orchestrator(stages);
        let first = orch.submit(input());
        let second = orch.submit(input());
        tokio::time::sleep(Duration::from_millis(50)).await;

        orch.shutdown();
        assert_eq!(orch.drain(Duration::from_secs(5)).await, 0);
        for id in [&first, &second] {
            let job = orch.get_status(id).unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error_kind, Some(JobErrorKind::Cancelled));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_reports_jobs_that_outlive_grace() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(10)).with(Stage::Extract, Behavior::Hang));
        let orch = orchestrator(stages);
        orch.submit(input());
        assert_eq!(orch.drain(Duration::from_millis(100)).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_stage_still_leaves_failed_job() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(1)).with(Stage::Render, Behavior::Panic));
        let orch = orchestrator(stages);
        let id = orch.submit(input());

        let job = orch.wait_for_terminal(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.current_step, Some(Stage::Render));
        assert_eq!(job.steps.len(), 4);
        assert_eq!(job.steps[3].status, StepStatus::Failed);
        assert!(job.total_duration_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_deadline_runs_job_to_completion() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(10)));
        let orch = Orchestrator::new(stages.clone(), Duration::MAX);
        let id = orch.submit(input());

        let job = orch.wait_for_terminal(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.steps.len(), 4);
        assert_eq!(stages.calls(Stage::Render), 1);
    }

    #[tokio::test]
    async fn test_submit_returns_pending_job_immediately() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(1)));
        let orch = orchestrator(stages);
        let id = orch.submit(input());

        // The current-thread test runtime has not polled the job task yet.
        let job = orch.get_status(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_step, None);
        assert!(job.steps.is_empty());
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job_is_none() {
        let orch = orchestrator(Arc::new(FakeStages::new(Duration::ZERO)));
        let id = JobId::from("missing".to_string());
        assert!(orch.get_status(&id).is_none());
        assert!(orch.wait_for_terminal(&id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_jobs_returns_every_job() {
        let orch = orchestrator(Arc::new(FakeStages::new(Duration::from_millis(1))));
        let first = orch.submit(input());
        let second = orch.submit(input());
        orch.wait_for_terminal(&first).await.unwrap();
        orch.wait_for_terminal(&second).await.unwrap();

        let ids: Vec<_> = orch.list_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first) && ids.contains(&second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_polling_sees_consistent_snapshots() {
        let stages = Arc::new(FakeStages::new(Duration::from_millis(5)));
        let orch = Arc::new(orchestrator(stages));
        let ids: Vec<JobId> = (0..8).map(|_| orch.submit(input())).collect();

        let mut pollers = Vec::new();
        for poller in 0..8 {
            let orch = orch.clone();
            let ids = ids.clone();
            pollers.push(tokio::spawn(async move {
                let mut observed = 0usize;
                loop {
                    let mut all_terminal = true;
                    for id in &ids {
                        let job = orch.get_status(id).unwrap();
                        observed += 1;
                        for (i, step) in job.steps.iter().enumerate() {
                            assert_eq!(step.stage, Stage::ALL[i], "poller {poller}");
                            assert_eq!(step.status, StepStatus::Completed);
                            assert!(step.error.is_none());
                        }
                        match job.status {
                            JobStatus::Pending => assert!(job.steps.is_empty()),
                            JobStatus::Running => {
                                let current = job.current_step.expect("running job has a step");
                                let idx = Stage::ALL.iter().position(|s| *s == current).unwrap();
                                assert!(job.steps.len() <= idx + 1);
                                assert!(job.result.is_none());
                            }
                            JobStatus::Completed => {
                                assert_eq!(job.steps.len(), 4);
                                assert!(job.result.is_some());
                                assert!(job.current_step.is_none());
                            }
                            JobStatus::Failed => panic!("no job should fail"),
                        }
                        all_terminal &= job.status.is_terminal();
                    }
                    if all_terminal {
                        return observed;
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for poller in pollers {
            assert!(poller.await.unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn test_llm_pipeline_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let entry = sample_entry("experience", &["rust"], "Built a Rust cache");
        let entry_id = entry.entry_id;
        let posting = r#"{
            "title": "Rust Engineer",
            "company": "Ferrous Labs",
            "seniority": "senior",
            "hard_requirements": [{"text": "Rust", "is_required": true}],
            "soft_signals": [],
            "keyword_inventory": [{"keyword": "Rust", "frequency": 3, "position_weight": 1.0}],
            "detected_tone": "product_oriented"
        }"#;
        let backend = Arc::new(ScriptedBackend::new().script(
            "primary",
            vec![
                Scripted::Reply(posting.into()),
                Scripted::Reply(r#"{"score": 90, "rationale": "Strong Rust."}"#.into()),
                Scripted::Reply(bullets_json(entry_id)),
                Scripted::Reply(NARRATIVE_JSON.into()),
            ],
        ));
        let (client, metrics) = client_with(backend.clone(), test_config());
        let pipeline = LlmPipeline::new(
            Arc::new(client),
            Arc::new(LocalArtifactStore::new(dir.path())),
            true,
        );
        let orch = Orchestrator::new(Arc::new(pipeline), Duration::from_secs(60));

        let id = orch.submit(JobInput {
            posting_text: "Rust Engineer at Ferrous Labs".to_string(),
            profile: UserProfile {
                user_id: Uuid::new_v4(),
                entries: vec![entry],
            },
        });
        let job = orch.wait_for_terminal(&id).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
        let result = job.result.unwrap();
        // keyword 100 blended with model 90
        assert_eq!(result.score, 96);
        assert_eq!(result.company.as_deref(), Some("Ferrous Labs"));
        assert_eq!(result.output_files.len(), 3);
        assert!(dir.path().join(format!("jobs/{id}/resume.md")).exists());
        assert_eq!(backend.count(), 4);

        let modules: BTreeMap<String, usize> =
            metrics.calls().into_iter().fold(BTreeMap::new(), |mut acc, c| {
                *acc.entry(c.module).or_default() += 1;
                acc
            });
        assert_eq!(modules.get("extract"), Some(&1));
        assert_eq!(modules.get("analyze"), Some(&1));
        assert_eq!(modules.get("generate"), Some(&2));
        assert_eq!(modules.get("render"), None);
    }
}
