//! Review orchestrator: turns change notifications into posted reviews.
//!
//! [`Orchestrator::submit`] only claims the job in the idempotency ledger and
//! enqueues it. A bounded pool of workers drains the queue; each job runs its
//! four stages sequentially on one worker:
//!
//! ```text
//! Received -> CredentialResolved -> DiffFetched -> ReviewGenerated -> Posted
//! ```
//!
//! Every stage attempt runs under the stage timeout and is retried with
//! backoff while its error is retryable and the budget lasts. `Unauthorized`
//! gets one credential refresh per job and a free retry instead. The comment
//! is only posted after the ledger granted the single post claim for the job.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use warden_core::{
    ChangeNotification, Claim, Credential, CredentialStore, ErrorKind, IdempotencyLedger,
    JobFailure, JobKey, JobState, JobStatus, NewJob, Outcome, PipelineConfig, RepoRef, Stage,
    StageAttempts, WardenError,
};

use crate::generator::ReviewGenerator;
use crate::github::SourceHost;
use crate::retry::RetryPolicy;

const LEDGER_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Finished outcomes kept in memory for late `await_outcome` calls.
const RETAINED_OUTCOMES: usize = 1024;
/// How often finished jobs past their retention are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    key: JobKey,
}

impl JobHandle {
    pub fn new(key: JobKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }
}

#[derive(Debug, Clone)]
enum Progress {
    Running(JobState),
    Done(Outcome),
}

#[derive(Debug, Clone)]
struct QueuedJob {
    key: JobKey,
    notification: ChangeNotification,
    /// Generation of the progress channel this run reports to.
    generation: u64,
    /// Set when a finishing job handed its repository slot to this one.
    admitted: bool,
}

impl QueuedJob {
    fn new(key: JobKey, notification: ChangeNotification, generation: u64) -> Self {
        Self {
            key,
            notification,
            generation,
            admitted: false,
        }
    }
}

/// Per-repository in-flight counter with FIFO parking.
///
/// Workers never wait on a repository: a job over the cap is parked and the
/// worker moves on. Releasing a slot hands it directly to the oldest parked
/// job, which keeps both the cap and arrival order.
struct RepoGate {
    limit: usize,
    inflight: HashMap<RepoRef, usize>,
    parked: HashMap<RepoRef, VecDeque<QueuedJob>>,
}

impl RepoGate {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            inflight: HashMap::new(),
            parked: HashMap::new(),
        }
    }

    /// Returns the job when it may run now; parks it otherwise.
    fn admit(&mut self, job: QueuedJob) -> Option<QueuedJob> {
        if job.admitted {
            return Some(job);
        }
        let repo = job.notification.repository.clone();
        let count = self.inflight.entry(repo.clone()).or_insert(0);
        if *count < self.limit {
            *count += 1;
            Some(job)
        } else {
            debug!(job_key = job.key.short(), repo = %repo, "repository at capacity, job parked");
            self.parked.entry(repo).or_default().push_back(job);
            None
        }
    }

    /// Free one slot of `repo`, returning the parked job that inherits it.
    fn release(&mut self, repo: &RepoRef) -> Option<QueuedJob> {
        if let Some(queue) = self.parked.get_mut(repo) {
            if let Some(mut next) = queue.pop_front() {
                if queue.is_empty() {
                    self.parked.remove(repo);
                }
                next.admitted = true;
                return Some(next);
            }
        }
        if let Some(count) = self.inflight.get_mut(repo) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.inflight.remove(repo);
            }
        }
        None
    }
}

/// Progress channel of the latest run of a job.
struct Tracked {
    generation: u64,
    tx: watch::Sender<Progress>,
}

#[derive(Default)]
struct Tracker {
    channels: HashMap<JobKey, Tracked>,
    finished: VecDeque<JobKey>,
    next_generation: u64,
}

/// Transient state of one job run. Payloads never leave it.
struct JobRun {
    generation: u64,
    attempts: StageAttempts,
    state: JobState,
    credential: Option<Credential>,
    refreshed: bool,
}

struct Inner {
    ledger: Arc<dyn IdempotencyLedger>,
    credentials: Arc<dyn CredentialStore>,
    host: Arc<dyn SourceHost>,
    generator: Arc<dyn ReviewGenerator>,
    retry: RetryPolicy,
    stage_timeout: Duration,
    queue: mpsc::UnboundedSender<QueuedJob>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
    gate: Mutex<RepoGate>,
    tracker: Mutex<Tracker>,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    ledger: Arc<dyn IdempotencyLedger>,
    credentials: Arc<dyn CredentialStore>,
    host: Arc<dyn SourceHost>,
    generator: Arc<dyn ReviewGenerator>,
    pipeline: PipelineConfig,
    retry: Option<RetryPolicy>,
    retention: Option<Duration>,
}

impl OrchestratorBuilder {
    pub fn pipeline(mut self, config: &PipelineConfig) -> Self {
        self.pipeline = config.clone();
        self
    }

    /// Override the retry policy derived from the pipeline configuration.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Periodically prune finished jobs older than `retention` from the ledger.
    pub fn retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Spawn the worker pool. Must be called inside a Tokio runtime.
    pub fn start(self) -> Orchestrator {
        let (queue, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);

        let inner = Arc::new(Inner {
            ledger: self.ledger,
            credentials: self.credentials,
            host: self.host,
            generator: self.generator,
            retry: self
                .retry
                .unwrap_or_else(|| RetryPolicy::from_config(&self.pipeline)),
            stage_timeout: self.pipeline.stage_timeout(),
            queue,
            receiver: tokio::sync::Mutex::new(receiver),
            gate: Mutex::new(RepoGate::new(self.pipeline.per_repository_limit)),
            tracker: Mutex::new(Tracker::default()),
        });

        let worker_count = self.pipeline.workers.max(1);
        let mut workers: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|worker| tokio::spawn(worker_loop(inner.clone(), worker, shutdown.subscribe())))
            .collect();
        if let Some(retention) = self.retention {
            workers.push(tokio::spawn(prune_loop(
                inner.clone(),
                retention,
                shutdown.subscribe(),
            )));
        }

        info!(
            workers = worker_count,
            per_repository_limit = self.pipeline.per_repository_limit,
            max_attempts = inner.retry.max_attempts,
            "review orchestrator started"
        );

        Orchestrator {
            inner,
            shutdown,
            workers: Mutex::new(workers),
        }
    }
}

/// Drives change notifications through the review pipeline.
pub struct Orchestrator {
    inner: Arc<Inner>,
    shutdown: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder(
        ledger: Arc<dyn IdempotencyLedger>,
        credentials: Arc<dyn CredentialStore>,
        host: Arc<dyn SourceHost>,
        generator: Arc<dyn ReviewGenerator>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            ledger,
            credentials,
            host,
            generator,
            pipeline: PipelineConfig::default(),
            retry: None,
            retention: None,
        }
    }

    /// Accept a change notification.
    ///
    /// Idempotent per job key: when the ledger already holds a live or posted
    /// job for the same key, its handle is returned and no work is created. A
    /// previously failed job is revived. Never waits on external services.
    ///
    /// # Errors
    ///
    /// [`WardenError::InvalidEvent`] if the event is not a change-request
    /// creation or update with repository and number; ledger errors otherwise.
    pub async fn submit(&self, event: ChangeNotification) -> Result<JobHandle, WardenError> {
        event.validate()?;
        let key = event.job_key();

        let claim = self
            .inner
            .ledger
            .claim(NewJob {
                key: key.clone(),
                notification: event.clone(),
            })
            .await?;

        match claim {
            Claim::Created(_) => {
                info!(
                    job_key = key.short(),
                    repo = %event.repository,
                    number = event.number,
                    action = %event.action,
                    "review job accepted"
                );
                let generation = self.inner.track(&key, JobState::Received);
                self.inner
                    .enqueue(QueuedJob::new(key.clone(), event, generation))?;
            }
            Claim::Existing(entry) => {
                debug!(
                    job_key = key.short(),
                    state = %entry.status.state,
                    "duplicate notification, job already known"
                );
            }
        }
        Ok(JobHandle::new(key))
    }

    /// Wait up to `timeout` for the job to reach a terminal state.
    ///
    /// Never cancels the job: on [`Outcome::Timeout`] it keeps running and the
    /// handle may be awaited again.
    pub async fn await_outcome(&self, handle: &JobHandle, timeout: Duration) -> Outcome {
        tokio::time::timeout(timeout, self.inner.wait(&handle.key))
            .await
            .unwrap_or(Outcome::Timeout)
    }

    /// Out-of-band status of a job, from the ledger.
    pub async fn status(&self, key: &JobKey) -> Result<Option<JobStatus>, WardenError> {
        Ok(self.inner.ledger.get(key).await?.map(|entry| entry.status))
    }

    /// Most recently touched jobs.
    pub async fn recent(&self, limit: usize) -> Result<Vec<JobStatus>, WardenError> {
        self.inner.ledger.list_recent(limit).await
    }

    /// Re-enqueue jobs left unfinished by a previous process.
    ///
    /// A job whose post was claimed but never recorded may already have a
    /// comment on the host; it is failed instead of retried.
    pub async fn recover(&self) -> Result<usize, WardenError> {
        let entries = self.inner.ledger.list_unfinished().await?;
        let mut requeued = 0;
        for entry in entries {
            let key = entry.status.key.clone();
            if entry.post_claimed_at.is_some() {
                warn!(job_key = key.short(), "abandoning job whose post outcome is unknown");
                let failure = JobFailure {
                    stage: Some(Stage::CommentPosting),
                    kind: ErrorKind::Internal,
                    message: "process stopped while posting; comment outcome unknown".into(),
                };
                self.inner
                    .ledger
                    .fail(&key, &failure, &entry.status.attempts)
                    .await?;
                continue;
            }
            let generation = self.inner.track(&key, entry.status.state);
            self.inner
                .enqueue(QueuedJob::new(key, entry.notification, generation))?;
            requeued += 1;
        }
        if requeued > 0 {
            info!(requeued, "recovered unfinished review jobs");
        }
        Ok(requeued)
    }

    /// Stop the workers after their current job.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "review worker ended abnormally");
            }
        }
        info!("review orchestrator stopped");
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize, mut shutdown: broadcast::Receiver<()>) {
    debug!(worker, "review worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            job = inner.next_job() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Some(job) = lock(&inner.gate).admit(job) else {
            continue;
        };
        let repo = job.notification.repository.clone();
        inner.run(job).await;

        let next = lock(&inner.gate).release(&repo);
        if let Some(next) = next {
            if inner.queue.send(next).is_err() {
                break;
            }
        }
    }
    debug!(worker, "review worker stopped");
}

async fn prune_loop(inner: Arc<Inner>, retention: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticks = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = ticks.tick() => {}
        }
        let cutoff = chrono::TimeDelta::from_std(retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            warn!(retention_secs = retention.as_secs(), "retention out of range, pruning disabled");
            break;
        };
        match inner.ledger.prune(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, %cutoff, "pruned finished review jobs"),
            Err(e) => warn!(error = %e, "ledger prune failed"),
        }
    }
}

impl Inner {
    async fn next_job(&self) -> Option<QueuedJob> {
        self.receiver.lock().await.recv().await
    }

    fn enqueue(&self, job: QueuedJob) -> Result<(), WardenError> {
        self.queue
            .send(job)
            .map_err(|_| WardenError::Internal("review queue is closed".into()))
    }

    /// Open a fresh progress channel for `key` and return its generation.
    fn track(&self, key: &JobKey, state: JobState) -> u64 {
        let (tx, _) = watch::channel(Progress::Running(state));
        let mut tracker = lock(&self.tracker);
        tracker.next_generation += 1;
        let generation = tracker.next_generation;
        tracker
            .channels
            .insert(key.clone(), Tracked { generation, tx });
        generation
    }

    /// Report progress of the run holding `generation`. A run superseded by a
    /// resubmission no longer owns the channel and is ignored.
    fn publish(&self, key: &JobKey, generation: u64, progress: Progress) {
        let mut tracker = lock(&self.tracker);
        let done = matches!(progress, Progress::Done(_));
        match tracker.channels.get(key) {
            Some(tracked) if tracked.generation == generation => {
                tracked.tx.send_replace(progress);
            }
            _ => {
                debug!(job_key = key.short(), generation, "dropping progress of a superseded run");
                return;
            }
        }
        if done {
            tracker.finished.push_back(key.clone());
            while tracker.finished.len() > RETAINED_OUTCOMES {
                let Some(old) = tracker.finished.pop_front() else {
                    break;
                };
                let still_done = tracker
                    .channels
                    .get(&old)
                    .is_some_and(|tracked| matches!(*tracked.tx.borrow(), Progress::Done(_)));
                if still_done {
                    tracker.channels.remove(&old);
                }
            }
        }
    }

    fn subscribe(&self, key: &JobKey) -> Option<watch::Receiver<Progress>> {
        lock(&self.tracker)
            .channels
            .get(key)
            .map(|tracked| tracked.tx.subscribe())
    }

    async fn wait(&self, key: &JobKey) -> Outcome {
        if let Some(mut rx) = self.subscribe(key) {
            loop {
                let done = match &*rx.borrow_and_update() {
                    Progress::Done(outcome) => Some(outcome.clone()),
                    Progress::Running(_) => None,
                };
                if let Some(outcome) = done {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        // Not run by this process (or evicted): the ledger is authoritative.
        loop {
            if let Some(outcome) = self.ledger_outcome(key).await {
                return outcome;
            }
            tokio::time::sleep(LEDGER_POLL_INTERVAL).await;
        }
    }

    /// Terminal outcome recorded in the ledger, `None` while still running.
    async fn ledger_outcome(&self, key: &JobKey) -> Option<Outcome> {
        match self.ledger.get(key).await {
            Ok(Some(entry)) => match entry.status.state {
                JobState::Posted => Some(Outcome::AlreadyPosted {
                    comment_url: entry.status.comment_url,
                }),
                JobState::Failed => Some(Outcome::Failure(entry.status.failure.unwrap_or(
                    JobFailure {
                        stage: None,
                        kind: ErrorKind::Internal,
                        message: "job failed without a recorded reason".into(),
                    },
                ))),
                _ => None,
            },
            Ok(None) => Some(Outcome::Failure(JobFailure {
                stage: None,
                kind: ErrorKind::Internal,
                message: format!("unknown job {key}"),
            })),
            Err(e) => {
                warn!(job_key = key.short(), error = %e, "ledger lookup failed while waiting");
                None
            }
        }
    }

    async fn run(&self, job: QueuedJob) {
        let span = info_span!(
            "review_job",
            job_key = job.key.short(),
            repo = %job.notification.repository,
            number = job.notification.number,
        );
        async {
            let mut run = JobRun {
                generation: job.generation,
                attempts: StageAttempts::default(),
                state: JobState::Received,
                credential: None,
                refreshed: false,
            };
            let outcome = match self.drive(&job, &mut run).await {
                Ok(outcome) => outcome,
                Err(failure) => {
                    warn!(
                        stage = failure.stage.map(|s| s.as_str()).unwrap_or("none"),
                        kind = %failure.kind,
                        error = %failure.message,
                        attempts = run.attempts.total(),
                        "review job failed"
                    );
                    if let Err(e) = self.ledger.fail(&job.key, &failure, &run.attempts).await {
                        error!(error = %e, "could not record job failure");
                    }
                    Outcome::Failure(failure)
                }
            };
            self.publish(&job.key, job.generation, Progress::Done(outcome));
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, job: &QueuedJob, run: &mut JobRun) -> Result<Outcome, JobFailure> {
        let key = &job.key;
        let entry = self
            .ledger
            .get(key)
            .await
            .map_err(|e| unstaged(&e))?
            .ok_or_else(|| JobFailure {
                stage: None,
                kind: ErrorKind::Internal,
                message: format!("ledger entry {key} is missing"),
            })?;

        match entry.status.state {
            JobState::Posted => {
                return Ok(Outcome::AlreadyPosted {
                    comment_url: entry.status.comment_url,
                })
            }
            JobState::Failed => {
                if let Some(failure) = entry.status.failure {
                    return Ok(Outcome::Failure(failure));
                }
            }
            _ => {}
        }
        if entry.post_claimed_at.is_some() {
            return Err(JobFailure {
                stage: Some(Stage::CommentPosting),
                kind: ErrorKind::Internal,
                message: "comment post was claimed but never recorded; outcome unknown".into(),
            });
        }
        run.attempts = entry.status.attempts;
        run.state = entry.status.state;

        let notification = &job.notification;
        let repo = &notification.repository;
        let number = notification.number;
        let selector = notification.identity.as_deref();

        let stage = Stage::CredentialResolution;
        let credential = self
            .run_stage(run, stage, move |_| self.credentials.resolve(repo, selector))
            .await
            .map_err(|e| JobFailure::at(stage, &e))?;
        debug!(identity = %credential.identity, "credential resolved");
        run.credential = Some(credential);
        self.advance(key, run, stage.completes_into())
            .await
            .map_err(|e| JobFailure::at(stage, &e))?;

        let stage = Stage::DiffFetch;
        let files = self
            .run_stage(run, stage, move |credential| async move {
                let credential = credential.ok_or_else(missing_credential)?;
                self.host.fetch_diff(repo, number, &credential).await
            })
            .await
            .map_err(|e| JobFailure::at(stage, &e))?;
        debug!(files = files.len(), "diff fetched");
        self.advance(key, run, stage.completes_into())
            .await
            .map_err(|e| JobFailure::at(stage, &e))?;

        let stage = Stage::ReviewGeneration;
        let patches = &files;
        let review = self
            .run_stage(run, stage, move |_| self.generator.generate(patches))
            .await
            .map_err(|e| JobFailure::at(stage, &e))?;
        drop(files);
        debug!(chars = review.len(), "review generated");
        self.advance(key, run, stage.completes_into())
            .await
            .map_err(|e| JobFailure::at(stage, &e))?;

        let stage = Stage::CommentPosting;
        let claimed = self
            .ledger
            .claim_post(key)
            .await
            .map_err(|e| JobFailure::at(stage, &e))?;
        if !claimed {
            warn!("comment post already claimed by another worker");
            return Ok(self.ledger_outcome(key).await.unwrap_or(Outcome::Failure(
                JobFailure {
                    stage: Some(stage),
                    kind: ErrorKind::Internal,
                    message: "comment post already claimed by another worker".into(),
                },
            )));
        }

        let url = notification.url.as_str();
        let text = review.as_str();
        let posted = self
            .run_stage(run, stage, move |credential| async move {
                let credential = credential.ok_or_else(missing_credential)?;
                self.host.post_comment(url, &credential, text).await
            })
            .await;
        let ack = match posted {
            Ok(ack) => ack,
            Err(e) => {
                if host_refused(&e) {
                    if let Err(release) = self.ledger.release_post(key).await {
                        warn!(error = %release, "could not release post claim");
                    }
                }
                return Err(JobFailure::at(stage, &e));
            }
        };

        self.ledger
            .complete(key, ack.url.as_deref(), &run.attempts)
            .await
            .map_err(|e| {
                error!(error = %e, "comment posted but the ledger could not record it");
                JobFailure::at(stage, &e)
            })?;
        run.state = JobState::Posted;
        info!(
            comment_url = ack.url.as_deref().unwrap_or(""),
            attempts = run.attempts.total(),
            "review posted"
        );
        Ok(Outcome::Success { review })
    }

    /// Run one stage until it succeeds, fails permanently, or exhausts the
    /// retry budget. `op` receives the job's current credential.
    async fn run_stage<T, F, Fut>(
        &self,
        run: &mut JobRun,
        stage: Stage,
        mut op: F,
    ) -> Result<T, WardenError>
    where
        F: FnMut(Option<Credential>) -> Fut,
        Fut: Future<Output = Result<T, WardenError>>,
    {
        let mut failed = 0;
        loop {
            run.attempts.record(stage);
            let attempt = run.attempts.get(stage);

            let result = match tokio::time::timeout(self.stage_timeout, op(run.credential.clone()))
                .await
            {
                Ok(result) => result,
                Err(_) if stage == Stage::ReviewGeneration => {
                    Err(WardenError::GenerationTimeout(self.stage_timeout))
                }
                Err(_) => Err(WardenError::Transient(format!(
                    "{stage} timed out after {}s",
                    self.stage_timeout.as_secs()
                ))),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if matches!(err, WardenError::Unauthorized(_)) && !run.refreshed {
                if let Some(identity) = run.credential.as_ref().map(|c| c.identity.clone()) {
                    run.refreshed = true;
                    warn!(stage = %stage, attempt, error = %err, "credential rejected, refreshing");
                    run.credential = Some(self.credentials.refresh(&identity).await?);
                    continue;
                }
            }

            failed += 1;
            if !self.retry.should_retry(failed, &err) {
                return Err(err);
            }
            let delay = self.retry.delay(failed, err.retry_after());
            warn!(
                stage = %stage,
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "stage attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Persist a stage transition. Never moves a recovered job backwards.
    async fn advance(
        &self,
        key: &JobKey,
        run: &mut JobRun,
        next: JobState,
    ) -> Result<(), WardenError> {
        let target = if progress_rank(next) > progress_rank(run.state) {
            next
        } else {
            run.state
        };
        self.ledger.advance(key, target, &run.attempts).await?;
        run.state = target;
        self.publish(key, run.generation, Progress::Running(target));
        Ok(())
    }
}

fn progress_rank(state: JobState) -> u8 {
    match state {
        JobState::Received => 0,
        JobState::CredentialResolved => 1,
        JobState::DiffFetched => 2,
        JobState::ReviewGenerated => 3,
        JobState::Posted | JobState::Failed => 4,
    }
}

/// The host answered and did not create the comment.
fn host_refused(err: &WardenError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::Unauthorized | ErrorKind::Rejected | ErrorKind::RateLimited
    )
}

fn missing_credential() -> WardenError {
    WardenError::Internal("stage ran without a resolved credential".into())
}

fn unstaged(err: &WardenError) -> JobFailure {
    JobFailure {
        stage: None,
        kind: err.kind(),
        message: err.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;
    use tokio::sync::Semaphore;
    use warden_core::{Ack, FilePatch, LedgerEntry};
    use warden_store::{Database, SqliteLedger};

    use super::*;
    use crate::prompt::bound_output;

    const MAX_OUTPUT: usize = 4000;

    #[derive(Default)]
    struct FakeCredentials {
        resolves: AtomicU32,
        refreshes: AtomicU32,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl CredentialStore for FakeCredentials {
        async fn get(&self, identity: &str) -> Result<Credential, WardenError> {
            Ok(Credential::new(identity, "token-1", RepoRef::new("acme", "widgets")))
        }

        async fn refresh(&self, identity: &str) -> Result<Credential, WardenError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::new(identity, "token-2", RepoRef::new("acme", "widgets")))
        }

        async fn select_repository(&self, _: &str, _: &RepoRef) -> Result<(), WardenError> {
            Ok(())
        }

        async fn resolve(
            &self,
            repo: &RepoRef,
            selector: Option<&str>,
        ) -> Result<Credential, WardenError> {
            if let Some(gate) = &self.gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|e| WardenError::Internal(e.to_string()))?;
            }
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::new(
                selector.unwrap_or("alice"),
                "token-1",
                repo.clone(),
            ))
        }
    }

    #[derive(Default)]
    struct FakeHost {
        files: Vec<FilePatch>,
        fetch_delay: Duration,
        fetch_failures: Mutex<VecDeque<WardenError>>,
        post_failures: Mutex<VecDeque<WardenError>>,
        fetch_calls: AtomicU32,
        post_calls: AtomicU32,
        /// (token, body) of every created comment.
        posts: Mutex<Vec<(String, String)>>,
        inflight: Mutex<HashMap<String, usize>>,
        max_inflight: Mutex<HashMap<String, usize>>,
    }

    impl FakeHost {
        fn with_files(files: Vec<FilePatch>) -> Self {
            Self {
                files,
                ..Self::default()
            }
        }

        fn failing_fetch(self, errors: Vec<WardenError>) -> Self {
            *lock(&self.fetch_failures) = errors.into();
            self
        }

        fn failing_post(self, errors: Vec<WardenError>) -> Self {
            *lock(&self.post_failures) = errors.into();
            self
        }

        fn posts(&self) -> Vec<(String, String)> {
            lock(&self.posts).clone()
        }
    }

    #[async_trait]
    impl SourceHost for FakeHost {
        async fn fetch_diff(
            &self,
            repo: &RepoRef,
            _number: u64,
            _credential: &Credential,
        ) -> Result<Vec<FilePatch>, WardenError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let name = repo.full_name();
            {
                let mut inflight = lock(&self.inflight);
                let now = inflight.entry(name.clone()).or_insert(0);
                *now += 1;
                let mut max = lock(&self.max_inflight);
                let seen = max.entry(name.clone()).or_insert(0);
                *seen = (*seen).max(*now);
            }
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            if let Some(count) = lock(&self.inflight).get_mut(&name) {
                *count -= 1;
            }

            match lock(&self.fetch_failures).pop_front() {
                Some(err) => Err(err),
                None => Ok(self.files.clone()),
            }
        }

        async fn post_comment(
            &self,
            change_request_url: &str,
            credential: &Credential,
            text: &str,
        ) -> Result<Ack, WardenError> {
            let call = self.post_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = lock(&self.post_failures).pop_front() {
                return Err(err);
            }
            lock(&self.posts).push((credential.token.clone(), text.to_string()));
            Ok(Ack {
                url: Some(format!("{change_request_url}#comment-{call}")),
            })
        }

        async fn register_webhook(
            &self,
            _repo: &RepoRef,
            _credential: &Credential,
            _callback_url: &str,
        ) -> Result<Ack, WardenError> {
            Ok(Ack::default())
        }
    }

    #[derive(Default)]
    struct FakeGenerator {
        calls: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl ReviewGenerator for FakeGenerator {
        async fn generate(&self, files: &[FilePatch]) -> Result<String, WardenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
            Ok(bound_output(
                &format!("Reviewed {} file(s): {}", files.len(), names.join(", ")),
                MAX_OUTPUT,
            ))
        }
    }

    /// SQLite ledger with injectable faults.
    struct ScriptedLedger {
        inner: SqliteLedger,
        fail_delay: Duration,
        broken_claim_post: bool,
        broken_complete: bool,
    }

    impl ScriptedLedger {
        fn new() -> Self {
            Self {
                inner: SqliteLedger::new(Arc::new(Database::in_memory().unwrap())),
                fail_delay: Duration::ZERO,
                broken_claim_post: false,
                broken_complete: false,
            }
        }
    }

    fn disk_full() -> WardenError {
        WardenError::Internal("disk I/O error".into())
    }

    #[async_trait]
    impl IdempotencyLedger for ScriptedLedger {
        async fn claim(&self, job: NewJob) -> Result<Claim, WardenError> {
            self.inner.claim(job).await
        }

        async fn advance(
            &self,
            key: &JobKey,
            state: JobState,
            attempts: &StageAttempts,
        ) -> Result<(), WardenError> {
            self.inner.advance(key, state, attempts).await
        }

        async fn claim_post(&self, key: &JobKey) -> Result<bool, WardenError> {
            if self.broken_claim_post {
                return Err(disk_full());
            }
            self.inner.claim_post(key).await
        }

        async fn release_post(&self, key: &JobKey) -> Result<(), WardenError> {
            self.inner.release_post(key).await
        }

        async fn complete(
            &self,
            key: &JobKey,
            comment_url: Option<&str>,
            attempts: &StageAttempts,
        ) -> Result<(), WardenError> {
            if self.broken_complete {
                return Err(disk_full());
            }
            self.inner.complete(key, comment_url, attempts).await
        }

        async fn fail(
            &self,
            key: &JobKey,
            failure: &JobFailure,
            attempts: &StageAttempts,
        ) -> Result<(), WardenError> {
            self.inner.fail(key, failure, attempts).await?;
            if !self.fail_delay.is_zero() {
                tokio::time::sleep(self.fail_delay).await;
            }
            Ok(())
        }

        async fn get(&self, key: &JobKey) -> Result<Option<LedgerEntry>, WardenError> {
            self.inner.get(key).await
        }

        async fn list_unfinished(&self) -> Result<Vec<LedgerEntry>, WardenError> {
            self.inner.list_unfinished().await
        }

        async fn list_recent(&self, limit: usize) -> Result<Vec<JobStatus>, WardenError> {
            self.inner.list_recent(limit).await
        }

        async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, WardenError> {
            self.inner.prune(cutoff).await
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        ledger: Arc<dyn IdempotencyLedger>,
        host: Arc<FakeHost>,
        credentials: Arc<FakeCredentials>,
        generator: Arc<FakeGenerator>,
    }

    fn pipeline(workers: usize, per_repository_limit: usize) -> PipelineConfig {
        PipelineConfig {
            workers,
            per_repository_limit,
            max_attempts: 3,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
            stage_timeout_secs: 5,
        }
    }

    fn new_ledger() -> Arc<SqliteLedger> {
        Arc::new(SqliteLedger::new(Arc::new(Database::in_memory().unwrap())))
    }

    fn start_with(
        ledger: Arc<dyn IdempotencyLedger>,
        host: FakeHost,
        credentials: FakeCredentials,
        generator: FakeGenerator,
        config: PipelineConfig,
    ) -> Harness {
        let host = Arc::new(host);
        let credentials = Arc::new(credentials);
        let generator = Arc::new(generator);
        let orchestrator = Orchestrator::builder(
            ledger.clone(),
            credentials.clone(),
            host.clone(),
            generator.clone(),
        )
        .pipeline(&config)
        .start();
        Harness {
            orchestrator,
            ledger,
            host,
            credentials,
            generator,
        }
    }

    fn start(host: FakeHost) -> Harness {
        start_with(
            new_ledger(),
            host,
            FakeCredentials::default(),
            FakeGenerator::default(),
            pipeline(4, 2),
        )
    }

    fn fifty_line_patch() -> FilePatch {
        let patch = (1..=50)
            .map(|i| format!("+let value_{i} = {i};"))
            .collect::<Vec<_>>()
            .join("\n");
        FilePatch::new("src/lib.rs", format!("@@ -0,0 +1,50 @@\n{patch}"))
    }

    fn event(repo: &str, number: u64, sha: &str) -> ChangeNotification {
        let repo: RepoRef = repo.parse().unwrap();
        let url = format!(
            "https://api.github.com/repos/{}/{}/pulls/{number}",
            repo.owner, repo.name
        );
        ChangeNotification::pull_request("opened", repo, number, url).with_head_sha(sha)
    }

    const WAIT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn end_to_end_review_is_posted_once() {
        let h = start(FakeHost::with_files(vec![fifty_line_patch()]));

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let outcome = h.orchestrator.await_outcome(&handle, WAIT).await;

        let Outcome::Success { review } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(!review.is_empty() && review.len() <= MAX_OUTPUT);
        assert_eq!(review, "Reviewed 1 file(s): src/lib.rs");
        assert_eq!(h.host.posts(), vec![("token-1".to_string(), review)]);
        assert_eq!(h.host.fetch_calls.load(Ordering::SeqCst), 1);

        let status = h.orchestrator.status(handle.key()).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Posted);
        assert_eq!(status.number, 42);
        assert_eq!(status.repository.full_name(), "acme/widgets");
        assert_eq!(status.attempts.total(), 4);
        assert!(status
            .comment_url
            .as_deref()
            .is_some_and(|u| u.ends_with("pulls/42#comment-1")));
    }

    #[tokio::test]
    async fn concurrent_duplicate_submits_post_one_comment() {
        let h = start(FakeHost::with_files(vec![fifty_line_patch()]));
        let orchestrator = Arc::new(h.orchestrator);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let orchestrator = orchestrator.clone();
            tasks.push(tokio::spawn(async move {
                orchestrator
                    .submit(event("acme/widgets", 42, "abc"))
                    .await
                    .unwrap()
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));

        for handle in &handles {
            assert!(matches!(
                orchestrator.await_outcome(handle, WAIT).await,
                Outcome::Success { .. }
            ));
        }
        assert_eq!(h.host.posts().len(), 1);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resubmitting_a_posted_job_does_no_work() {
        let h = start(FakeHost::with_files(vec![fifty_line_patch()]));
        let first = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        h.orchestrator.await_outcome(&first, WAIT).await;

        let second = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(matches!(
            h.orchestrator.await_outcome(&second, WAIT).await,
            Outcome::Success { .. }
        ));
        assert_eq!(h.host.posts().len(), 1);
        assert_eq!(h.host.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_head_sha_is_a_new_job() {
        let h = start(FakeHost::with_files(vec![fifty_line_patch()]));
        let first = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        h.orchestrator.await_outcome(&first, WAIT).await;
        let second = h
            .orchestrator
            .submit(event("acme/widgets", 42, "def"))
            .await
            .unwrap();
        h.orchestrator.await_outcome(&second, WAIT).await;

        assert_ne!(first, second);
        assert_eq!(h.host.posts().len(), 2);
    }

    #[tokio::test]
    async fn transient_failures_within_budget_still_post() {
        let host = FakeHost::with_files(vec![fifty_line_patch()]).failing_fetch(vec![
            WardenError::Transient("502 bad gateway".into()),
            WardenError::Transient("connection reset".into()),
        ]);
        let h = start(host);

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        assert!(matches!(
            h.orchestrator.await_outcome(&handle, WAIT).await,
            Outcome::Success { .. }
        ));
        assert_eq!(h.host.fetch_calls.load(Ordering::SeqCst), 3);
        let status = h.orchestrator.status(handle.key()).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Posted);
        assert_eq!(status.attempts.diff_fetch, 3);
    }

    #[tokio::test]
    async fn exhausted_budget_fails_the_job() {
        let host = FakeHost::with_files(vec![fifty_line_patch()]).failing_fetch(vec![
            WardenError::Transient("1".into()),
            WardenError::Transient("2".into()),
            WardenError::Transient("3".into()),
        ]);
        let h = start(host);

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let Outcome::Failure(failure) = h.orchestrator.await_outcome(&handle, WAIT).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, Some(Stage::DiffFetch));
        assert_eq!(failure.kind, ErrorKind::Transient);
        assert_eq!(h.host.fetch_calls.load(Ordering::SeqCst), 3);
        assert!(h.host.posts().is_empty());
    }

    #[tokio::test]
    async fn not_found_fails_after_one_attempt() {
        let host = FakeHost::with_files(vec![fifty_line_patch()])
            .failing_fetch(vec![WardenError::NotFound("pull request closed".into())]);
        let h = start(host);

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let Outcome::Failure(failure) = h.orchestrator.await_outcome(&handle, WAIT).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, Some(Stage::DiffFetch));
        assert_eq!(failure.kind, ErrorKind::NotFound);
        assert_eq!(h.host.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);

        let status = h.orchestrator.status(handle.key()).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.failure, Some(failure));
    }

    #[tokio::test]
    async fn failed_job_is_retried_on_resubmission() {
        let host = FakeHost::with_files(vec![fifty_line_patch()])
            .failing_fetch(vec![WardenError::NotFound("temporarily hidden".into())]);
        let h = start(host);

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        assert!(matches!(
            h.orchestrator.await_outcome(&handle, WAIT).await,
            Outcome::Failure(_)
        ));

        let again = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        assert!(matches!(
            h.orchestrator.await_outcome(&again, WAIT).await,
            Outcome::Success { .. }
        ));
        assert_eq!(h.host.posts().len(), 1);
    }

    #[tokio::test]
    async fn late_failure_of_previous_run_does_not_reach_revived_job() {
        let ledger = ScriptedLedger {
            fail_delay: Duration::from_millis(300),
            ..ScriptedLedger::new()
        };
        let host = FakeHost::with_files(vec![fifty_line_patch()])
            .failing_fetch(vec![WardenError::NotFound("temporarily hidden".into())]);
        let h = start_with(
            Arc::new(ledger),
            host,
            FakeCredentials::default(),
            FakeGenerator::default(),
            pipeline(2, 2),
        );

        let first = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        // The failure is durable while the first run is still finishing.
        tokio::time::timeout(WAIT, async {
            loop {
                let status = h.orchestrator.status(first.key()).await.unwrap().unwrap();
                if status.state == JobState::Failed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let revived = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let outcome = h.orchestrator.await_outcome(&revived, WAIT).await;
        assert!(matches!(outcome, Outcome::Success { .. }), "{outcome:?}");

        // Let the first run publish its stale outcome, then look again.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let outcome = h.orchestrator.await_outcome(&revived, WAIT).await;
        assert!(matches!(outcome, Outcome::Success { .. }), "{outcome:?}");

        let status = h.orchestrator.status(revived.key()).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Posted);
        assert_eq!(h.host.posts().len(), 1);
    }

    #[tokio::test]
    async fn ledger_error_on_post_claim_blocks_posting() {
        let ledger = ScriptedLedger {
            broken_claim_post: true,
            ..ScriptedLedger::new()
        };
        let h = start_with(
            Arc::new(ledger),
            FakeHost::with_files(vec![fifty_line_patch()]),
            FakeCredentials::default(),
            FakeGenerator::default(),
            pipeline(2, 2),
        );

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let outcome = h.orchestrator.await_outcome(&handle, WAIT).await;

        let Outcome::Failure(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.kind, ErrorKind::Internal);
        assert_eq!(failure.stage, Some(Stage::CommentPosting));
        assert_eq!(h.host.post_calls.load(Ordering::SeqCst), 0);
        let status = h.orchestrator.status(handle.key()).await.unwrap().unwrap();
        assert_ne!(status.state, JobState::Posted);
    }

    #[tokio::test]
    async fn ledger_error_recording_post_is_an_internal_failure() {
        let ledger = ScriptedLedger {
            broken_complete: true,
            ..ScriptedLedger::new()
        };
        let h = start_with(
            Arc::new(ledger),
            FakeHost::with_files(vec![fifty_line_patch()]),
            FakeCredentials::default(),
            FakeGenerator::default(),
            pipeline(2, 2),
        );

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let outcome = h.orchestrator.await_outcome(&handle, WAIT).await;

        let Outcome::Failure(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.kind, ErrorKind::Internal);
        assert_eq!(failure.stage, Some(Stage::CommentPosting));
        assert_eq!(h.host.post_calls.load(Ordering::SeqCst), 1);
        let status = h.orchestrator.status(handle.key()).await.unwrap().unwrap();
        assert_ne!(status.state, JobState::Posted);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_is_the_floor_for_the_next_attempt() {
        let host = FakeHost::with_files(vec![fifty_line_patch()]).failing_fetch(vec![
            WardenError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
                message: "secondary rate limit".into(),
            },
        ]);
        let h = start(host);

        let started = tokio::time::Instant::now();
        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let outcome = h
            .orchestrator
            .await_outcome(&handle, Duration::from_secs(120))
            .await;

        assert!(matches!(outcome, Outcome::Success { .. }), "{outcome:?}");
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(h.host.fetch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_jobs_past_retention_are_pruned() {
        let ledger = new_ledger();
        let host = Arc::new(FakeHost::with_files(vec![fifty_line_patch()]));
        let orchestrator = Orchestrator::builder(
            ledger.clone(),
            Arc::new(FakeCredentials::default()),
            host.clone(),
            Arc::new(FakeGenerator::default()),
        )
        .pipeline(&pipeline(2, 2))
        .retention(Some(Duration::ZERO))
        .start();

        let handle = orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        assert!(matches!(
            orchestrator.await_outcome(&handle, WAIT).await,
            Outcome::Success { .. }
        ));
        assert!(ledger.get(handle.key()).await.unwrap().is_some());

        tokio::time::sleep(PRUNE_INTERVAL * 2).await;
        assert!(ledger.get(handle.key()).await.unwrap().is_none());
        assert_eq!(host.posts().len(), 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn unauthorized_post_refreshes_once_and_retries() {
        let host = FakeHost::with_files(vec![fifty_line_patch()])
            .failing_post(vec![WardenError::Unauthorized("bad credentials".into())]);
        let h = start(host);

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        assert!(matches!(
            h.orchestrator.await_outcome(&handle, WAIT).await,
            Outcome::Success { .. }
        ));
        assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(h.host.post_calls.load(Ordering::SeqCst), 2);
        let posts = h.host.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "token-2");

        let status = h.orchestrator.status(handle.key()).await.unwrap().unwrap();
        assert_eq!(status.attempts.comment_posting, 2);
    }

    #[tokio::test]
    async fn second_unauthorized_fails_without_another_refresh() {
        let host = FakeHost::with_files(vec![fifty_line_patch()]).failing_fetch(vec![
            WardenError::Unauthorized("bad credentials".into()),
            WardenError::Unauthorized("still bad".into()),
        ]);
        let h = start(host);

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let Outcome::Failure(failure) = h.orchestrator.await_outcome(&handle, WAIT).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::Unauthorized);
        assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(h.host.fetch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refused_post_releases_claim_for_later_retry() {
        let host = FakeHost::with_files(vec![fifty_line_patch()])
            .failing_post(vec![WardenError::Rejected("locked conversation".into())]);
        let h = start(host);

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let Outcome::Failure(failure) = h.orchestrator.await_outcome(&handle, WAIT).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, Some(Stage::CommentPosting));
        let entry = h.ledger.get(handle.key()).await.unwrap().unwrap();
        assert!(entry.post_claimed_at.is_none());

        let again = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        assert!(matches!(
            h.orchestrator.await_outcome(&again, WAIT).await,
            Outcome::Success { .. }
        ));
    }

    #[tokio::test]
    async fn zero_timeout_on_received_job_is_timeout() {
        let gate = Arc::new(Semaphore::new(0));
        let h = start_with(
            new_ledger(),
            FakeHost::with_files(vec![fifty_line_patch()]),
            FakeCredentials {
                gate: Some(gate.clone()),
                ..FakeCredentials::default()
            },
            FakeGenerator::default(),
            pipeline(2, 2),
        );

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.await_outcome(&handle, Duration::ZERO).await,
            Outcome::Timeout
        );
        let status = h.orchestrator.status(handle.key()).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Received);

        gate.add_permits(1);
        assert!(matches!(
            h.orchestrator.await_outcome(&handle, WAIT).await,
            Outcome::Success { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generation_times_out_per_attempt() {
        let mut config = pipeline(1, 1);
        config.max_attempts = 2;
        config.stage_timeout_secs = 1;
        let h = start_with(
            new_ledger(),
            FakeHost::with_files(vec![fifty_line_patch()]),
            FakeCredentials::default(),
            FakeGenerator {
                delay: Duration::from_secs(30),
                ..FakeGenerator::default()
            },
            config,
        );

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        let Outcome::Failure(failure) = h
            .orchestrator
            .await_outcome(&handle, Duration::from_secs(60))
            .await
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, Some(Stage::ReviewGeneration));
        assert_eq!(failure.kind, ErrorKind::GenerationTimeout);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
        assert!(h.host.posts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn per_repository_limit_bounds_in_flight_jobs() {
        let host = FakeHost {
            files: vec![fifty_line_patch()],
            fetch_delay: Duration::from_millis(100),
            ..FakeHost::default()
        };
        let h = start_with(
            new_ledger(),
            host,
            FakeCredentials::default(),
            FakeGenerator::default(),
            pipeline(4, 1),
        );

        let mut handles = Vec::new();
        for number in 1..=3 {
            handles.push(
                h.orchestrator
                    .submit(event("acme/widgets", number, "abc"))
                    .await
                    .unwrap(),
            );
        }
        handles.push(
            h.orchestrator
                .submit(event("acme/gadgets", 1, "abc"))
                .await
                .unwrap(),
        );

        for handle in &handles {
            assert!(matches!(
                h.orchestrator.await_outcome(handle, WAIT).await,
                Outcome::Success { .. }
            ));
        }
        let max = lock(&h.host.max_inflight).clone();
        assert_eq!(max.get("acme/widgets"), Some(&1));
        assert_eq!(max.get("acme/gadgets"), Some(&1));
        assert_eq!(h.host.posts().len(), 4);
    }

    #[tokio::test]
    async fn recover_requeues_unfinished_and_abandons_claimed_posts() {
        let ledger = new_ledger();
        let pending = event("acme/widgets", 1, "abc");
        let posting = event("acme/widgets", 2, "abc");
        for notification in [&pending, &posting] {
            ledger
                .claim(NewJob {
                    key: notification.job_key(),
                    notification: notification.clone(),
                })
                .await
                .unwrap();
        }
        for state in [
            JobState::CredentialResolved,
            JobState::DiffFetched,
            JobState::ReviewGenerated,
        ] {
            ledger
                .advance(&posting.job_key(), state, &StageAttempts::default())
                .await
                .unwrap();
        }
        assert!(ledger.claim_post(&posting.job_key()).await.unwrap());

        let h = start_with(
            ledger,
            FakeHost::with_files(vec![fifty_line_patch()]),
            FakeCredentials::default(),
            FakeGenerator::default(),
            pipeline(2, 2),
        );
        assert_eq!(h.orchestrator.recover().await.unwrap(), 1);

        let recovered = JobHandle::new(pending.job_key());
        assert!(matches!(
            h.orchestrator.await_outcome(&recovered, WAIT).await,
            Outcome::Success { .. }
        ));

        let abandoned = JobHandle::new(posting.job_key());
        let Outcome::Failure(failure) = h.orchestrator.await_outcome(&abandoned, WAIT).await
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::Internal);
        assert_eq!(h.host.posts().len(), 1);
    }

    #[tokio::test]
    async fn invalid_events_are_rejected_without_a_job() {
        let h = start(FakeHost::default());

        let mut closed = event("acme/widgets", 42, "abc");
        closed.action = "closed".into();
        let err = h.orchestrator.submit(closed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEvent);

        let missing_number = event("acme/widgets", 0, "abc");
        let err = h.orchestrator.submit(missing_number).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEvent);

        assert!(h.orchestrator.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_handle_reports_internal_failure() {
        let h = start(FakeHost::default());
        let handle = JobHandle::new(JobKey::from_raw("does-not-exist"));
        let Outcome::Failure(failure) = h.orchestrator.await_outcome(&handle, WAIT).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn shutdown_stops_processing() {
        let h = start(FakeHost::with_files(vec![fifty_line_patch()]));
        h.orchestrator.shutdown().await;

        let handle = h
            .orchestrator
            .submit(event("acme/widgets", 42, "abc"))
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator
                .await_outcome(&handle, Duration::from_millis(50))
                .await,
            Outcome::Timeout
        );
        assert_eq!(h.host.fetch_calls.load(Ordering::SeqCst), 0);
    }

    fn queued(repo: &str, number: u64) -> QueuedJob {
        let event = event(repo, number, "abc");
        QueuedJob::new(event.job_key(), event, 0)
    }

    #[test]
    fn gate_parks_over_limit_and_hands_slots_over_in_order() {
        let mut gate = RepoGate::new(1);
        let widgets = RepoRef::new("acme", "widgets");

        assert!(gate.admit(queued("acme/widgets", 1)).is_some());
        assert!(gate.admit(queued("acme/widgets", 2)).is_none());
        assert!(gate.admit(queued("acme/widgets", 3)).is_none());
        assert!(gate.admit(queued("acme/gadgets", 1)).is_some());

        let next = gate.release(&widgets).unwrap();
        assert_eq!(next.notification.number, 2);
        assert!(next.admitted);
        assert!(gate.admit(next).is_some());

        let next = gate.release(&widgets).unwrap();
        assert_eq!(next.notification.number, 3);
        assert!(gate.release(&widgets).is_none());
        assert!(gate.inflight.get(&widgets).is_none());
        assert!(gate.admit(queued("acme/widgets", 4)).is_some());
    }
}
