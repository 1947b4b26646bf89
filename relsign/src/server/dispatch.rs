// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The job dispatcher runs signing programs against uploaded content.
//!
//! Each format has its own queue and its own pool of at most `concurrency` workers. Workers are
//! started when work is submitted, exit once the queue is empty or they've processed
//! `jobs_per_worker` jobs, and are replaced while work remains.
//!
//! A `(hash, format)` pair has at most one job at a time. Submitting a pair that's already
//! pending returns a handle to the existing job rather than queueing another.
//!
//! Workers report completion by sending an [`Event`] to the completion consumer
//! ([`Dispatcher::process_events`]), which records the output's filename and wakes everyone
//! waiting on the job.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{mpsc, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};
use uuid::Uuid;

use crate::{
    error::{SigningError, StoreError},
    server::{
        config::{Format, FormatRegistry},
        process::{self, RetryPolicy},
        store::ContentStore,
    },
};

/// The number of attempts the startup self-test makes before giving up.
const SELF_TEST_ATTEMPTS: u32 = 2;

/// Where a job is in its life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done { output_hash: String },
    Failed { log: String },
}

/// A handle on a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    receiver: watch::Receiver<JobStatus>,
}

impl JobHandle {
    /// Wait up to `timeout` for the job to finish and return its status.
    ///
    /// The job may still be [`JobStatus::Pending`] when this returns.
    pub async fn wait(&mut self, timeout: Duration) -> JobStatus {
        let finished = self
            .receiver
            .wait_for(|status| !matches!(status, JobStatus::Pending));
        if tokio::time::timeout(timeout, finished).await.is_err() {
            tracing::debug!(?timeout, "Gave up waiting for pending job");
        }
        self.receiver.borrow().clone()
    }
}

/// The result of [`Dispatcher::submit`].
#[derive(Debug)]
pub enum Submission {
    /// A new job was queued.
    Queued(JobHandle),
    /// A job for the same content and format was already pending.
    Pending(JobHandle),
}

impl Submission {
    pub fn handle(self) -> JobHandle {
        match self {
            Submission::Queued(handle) | Submission::Pending(handle) => handle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub hash: String,
    pub filename: String,
    pub format: Arc<Format>,
}

/// Sent by workers when a job finishes.
#[derive(Debug)]
pub enum Event {
    Done { job: Job, output_hash: String },
    Failed { job: Job, log: String },
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<(String, String), watch::Sender<JobStatus>>,
    queues: HashMap<String, VecDeque<Job>>,
    workers: HashMap<String, usize>,
}

#[derive(Debug)]
struct Inner {
    store: ContentStore,
    formats: FormatRegistry,
    policy: RetryPolicy,
    jobs_per_worker: usize,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<Event>,
    workers: TaskTracker,
}

/// Queues signing jobs and runs them on per-format worker pools.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// The returned receiver must be passed to [`Dispatcher::process_events`], or jobs will never
    /// be marked as finished.
    pub fn new(
        store: ContentStore,
        formats: FormatRegistry,
        policy: RetryPolicy,
        jobs_per_worker: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Inner {
            store,
            formats,
            policy,
            jobs_per_worker: jobs_per_worker.max(1),
            state: Mutex::new(State::default()),
            events,
            workers: TaskTracker::new(),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Sign each format's test file, failing if any format's signing program fails.
    pub async fn self_test(&self) -> anyhow::Result<()> {
        let policy = self.inner.policy.with_max_attempts(SELF_TEST_ATTEMPTS);
        for format in self.inner.formats.iter() {
            process::self_test(format, policy).await?;
        }
        Ok(())
    }

    /// Queue a job to sign the content for `hash` in `format`.
    ///
    /// If a job for the pair is already pending, no new job is queued and a handle to the pending
    /// job is returned instead.
    #[instrument(skip(self), err)]
    pub fn submit(
        &self,
        hash: &str,
        filename: &str,
        format: &str,
    ) -> Result<Submission, StoreError> {
        let format = self
            .inner
            .formats
            .get(format)
            .ok_or_else(|| StoreError::UnknownFormat(format.to_string()))?
            .clone();
        let key = (hash.to_string(), format.name.clone());

        let mut state = self.inner.state.lock().expect("dispatcher lock is poisoned");
        if let Some(sender) = state.pending.get(&key) {
            tracing::debug!("Job is already pending");
            return Ok(Submission::Pending(JobHandle {
                receiver: sender.subscribe(),
            }));
        }

        let (sender, receiver) = watch::channel(JobStatus::Pending);
        state.pending.insert(key, sender);
        let job = Job {
            id: Uuid::now_v7(),
            hash: hash.to_string(),
            filename: filename.to_string(),
            format,
        };
        tracing::info!(job_id = %job.id, "Queued signing job");
        let format_name = job.format.name.clone();
        state
            .queues
            .entry(format_name.clone())
            .or_default()
            .push_back(job);
        self.inner.start_worker(&mut state, &format_name);

        Ok(Submission::Queued(JobHandle { receiver }))
    }

    /// A handle on the pending job for `hash` in `format`, if there is one.
    pub fn pending(&self, hash: &str, format: &str) -> Option<JobHandle> {
        let state = self.inner.state.lock().expect("dispatcher lock is poisoned");
        state
            .pending
            .get(&(hash.to_string(), format.to_string()))
            .map(|sender| JobHandle {
                receiver: sender.subscribe(),
            })
    }

    /// The number of pending jobs.
    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("dispatcher lock is poisoned")
            .pending
            .len()
    }

    /// Apply completion events until `halt_token` is cancelled.
    ///
    /// Once cancelled, events already sent are applied before returning.
    pub async fn process_events(
        &self,
        mut events: mpsc::UnboundedReceiver<Event>,
        halt_token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = halt_token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.complete(event).await,
                None => return,
            }
        }

        while let Ok(event) = events.try_recv() {
            self.complete(event).await;
        }
        tracing::debug!("Completion event consumer stopped");
    }

    /// Wait for every running worker to finish its current queue.
    pub async fn shutdown(&self) {
        self.inner.workers.close();
        self.inner.workers.wait().await;
        tracing::info!("All signing workers have finished");
    }

    #[instrument(skip_all, fields(job_id = %job_id(&event), hash = job_hash(&event)))]
    async fn complete(&self, event: Event) {
        let (job, status) = match event {
            Event::Done { job, output_hash } => {
                // Remember the name for the output too, so it can be signed again by hash.
                if let Err(error) = self
                    .inner
                    .store
                    .save_filename(&output_hash, &job.filename)
                    .await
                {
                    tracing::error!(?error, output_hash, "Failed to record output filename");
                }
                (job, JobStatus::Done { output_hash })
            }
            Event::Failed { job, log } => (job, JobStatus::Failed { log }),
        };

        let key = (job.hash.clone(), job.format.name.clone());
        let sender = self
            .inner
            .state
            .lock()
            .expect("dispatcher lock is poisoned")
            .pending
            .remove(&key);
        match sender {
            Some(sender) => {
                sender.send_replace(status);
            }
            None => tracing::error!("Completion event for a job that isn't pending"),
        }
    }
}

fn job_id(event: &Event) -> Uuid {
    match event {
        Event::Done { job, .. } | Event::Failed { job, .. } => job.id,
    }
}

fn job_hash(event: &Event) -> &str {
    match event {
        Event::Done { job, .. } | Event::Failed { job, .. } => &job.hash,
    }
}

impl Inner {
    /// Start a worker for `format` unless its pool is already full.
    fn start_worker(self: &Arc<Self>, state: &mut State, format: &str) {
        let Some(concurrency) = self.formats.get(format).map(|format| format.concurrency.get())
        else {
            return;
        };
        let workers = state.workers.entry(format.to_string()).or_default();
        if *workers >= concurrency {
            return;
        }
        *workers += 1;
        tracing::debug!(format, workers = *workers, "Starting signing worker");

        let inner = self.clone();
        let format = format.to_string();
        self.workers.spawn(
            async move { inner.worker(format).await }
                .instrument(tracing::info_span!("worker")),
        );
    }

    async fn worker(self: Arc<Self>, format: String) {
        for _ in 0..self.jobs_per_worker {
            let job = {
                let mut state = self.state.lock().expect("dispatcher lock is poisoned");
                let job = state.queues.get_mut(&format).and_then(VecDeque::pop_front);
                if job.is_none() {
                    if let Some(workers) = state.workers.get_mut(&format) {
                        *workers -= 1;
                    }
                    tracing::debug!(format, "No queued jobs; worker exiting");
                    return;
                }
                job
            };
            if let Some(job) = job {
                self.run(job).await;
            }
        }

        let mut state = self.state.lock().expect("dispatcher lock is poisoned");
        if let Some(workers) = state.workers.get_mut(&format) {
            *workers -= 1;
        }
        tracing::debug!(format, "Worker reached its job limit; retiring");
        if state.queues.get(&format).is_some_and(|queue| !queue.is_empty()) {
            self.start_worker(&mut state, &format);
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, hash = job.hash, format = %job.format.name))]
    async fn run(&self, job: Job) {
        tracing::info!(filename = job.filename, "Signing");
        let event = match self.sign(&job).await {
            Ok(output_hash) => {
                tracing::info!(output_hash, "Signing succeeded");
                Event::Done { job, output_hash }
            }
            Err(SigningError::Failed { attempts, log }) => {
                tracing::warn!(attempts, log, "Signing failed");
                Event::Failed { job, log }
            }
            Err(error) => {
                tracing::error!(?error, "Signing job hit an error");
                Event::Failed {
                    job,
                    log: String::new(),
                }
            }
        };

        if let Err(error) = self.events.send(event) {
            tracing::error!(?error, "Completion consumer is gone; dropping event");
        }
    }

    async fn sign(&self, job: &Job) -> Result<String, SigningError> {
        let format = &job.format.name;
        let input = self
            .store
            .inbound(&job.hash)
            .await?
            .ok_or(StoreError::NotFound)?;
        let output = self.store.scratch(format).await?;
        let log = self.store.log_path(&job.hash, format)?;

        process::run_signing_program(&job.format, &input, &output, &job.filename, &log, self.policy)
            .await?;

        Ok(self.store.promote(&job.hash, format, output).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use bytes::Bytes;
    use http_body_util::Full;

    use super::*;
    use crate::server::{crypto, test_utils};

    struct Harness {
        dispatcher: Dispatcher,
        store: ContentStore,
        halt_token: CancellationToken,
        consumer: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        async fn new(
            dir: &Path,
            script: &str,
            concurrency: usize,
            jobs_per_worker: usize,
        ) -> anyhow::Result<Self> {
            let script = test_utils::script(dir, "sign.sh", script)?;
            let mut config = test_utils::config(&dir.join("state"), &script);
            for format in config.formats.values_mut() {
                format.concurrency = concurrency.try_into()?;
            }
            let store = ContentStore::new(&config).await?;
            let formats = FormatRegistry::new(&config.formats, &test_utils::secrets());
            let policy = RetryPolicy::from(&config.signing).with_max_attempts(1);
            let (dispatcher, events) =
                Dispatcher::new(store.clone(), formats, policy, jobs_per_worker);

            let halt_token = CancellationToken::new();
            let consumer = tokio::spawn({
                let dispatcher = dispatcher.clone();
                let halt_token = halt_token.clone();
                async move { dispatcher.process_events(events, halt_token).await }
            });

            Ok(Self {
                dispatcher,
                store,
                halt_token,
                consumer,
            })
        }

        async fn upload(&self, content: &'static [u8]) -> anyhow::Result<String> {
            let hash = crypto::sha1_hex(content);
            self.store
                .put_inbound(&hash, "app.bin", Full::new(Bytes::from_static(content)))
                .await?;
            Ok(hash)
        }

        async fn stop(self) -> anyhow::Result<()> {
            self.dispatcher.shutdown().await;
            self.halt_token.cancel();
            self.consumer.await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_submissions_run_once() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let counter = dir.path().join("invocations");
        let harness = Harness::new(
            dir.path(),
            &format!(
                "echo run >> {}\nsleep 0.5\n{{ cat \"$2\"; echo signed; }} > \"$3\"\n",
                counter.display()
            ),
            2,
            10,
        )
        .await?;
        let hash = harness.upload(b"release artifact contents\n").await?;

        let first = harness.dispatcher.submit(&hash, "app.bin", "fmtA")?;
        let second = harness.dispatcher.submit(&hash, "app.bin", "fmtA")?;
        assert!(matches!(first, Submission::Queued(_)));
        assert!(matches!(second, Submission::Pending(_)));
        assert!(harness.dispatcher.pending(&hash, "fmtA").is_some());

        let (first, second) = tokio::join!(
            async { first.handle().wait(Duration::from_secs(10)).await },
            async { second.handle().wait(Duration::from_secs(10)).await },
        );
        let expected = crypto::sha1_hex(b"release artifact contents\nsigned\n");
        assert_eq!(
            first,
            JobStatus::Done {
                output_hash: expected.clone()
            }
        );
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&counter)?.lines().count(), 1);

        assert!(harness.dispatcher.pending(&hash, "fmtA").is_none());
        assert!(harness.store.has_signed(&hash, "fmtA").await?);
        assert_eq!(
            harness.store.filename(&expected).await?.as_deref(),
            Some("app.bin")
        );

        harness.stop().await
    }

    #[tokio::test]
    async fn failed_jobs_report_the_log_and_leave_no_output() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let harness = Harness::new(
            dir.path(),
            "echo 'partial' > \"$3\"\necho 'token not present' >&2\nexit 1\n",
            1,
            10,
        )
        .await?;
        let hash = harness.upload(b"release artifact contents").await?;

        let status = harness
            .dispatcher
            .submit(&hash, "app.bin", "fmtA")?
            .handle()
            .wait(Duration::from_secs(10))
            .await;
        match status {
            JobStatus::Failed { log } => assert!(log.contains("token not present")),
            other => panic!("expected the job to fail, got {other:?}"),
        }

        assert!(!harness.store.has_signed(&hash, "fmtA").await?);
        let leftovers = std::fs::read_dir(harness.store.signed_directory().join("fmtA"))?
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(leftovers, vec![format!("{hash}.out")]);

        // The failure cleared the pending entry, so the job can be submitted again.
        assert!(matches!(
            harness.dispatcher.submit(&hash, "app.bin", "fmtA")?,
            Submission::Queued(_)
        ));

        harness.stop().await
    }

    #[tokio::test]
    async fn retired_workers_are_replaced() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let harness = Harness::new(dir.path(), "cp \"$2\" \"$3\"\n", 1, 1).await?;

        let mut handles = vec![];
        for content in [
            b"first release artifact".as_slice(),
            b"second release artifact".as_slice(),
            b"third release artifact".as_slice(),
        ] {
            let hash = harness.upload(content).await?;
            handles.push(harness.dispatcher.submit(&hash, "app.bin", "fmtB")?.handle());
        }

        for mut handle in handles {
            assert!(matches!(
                handle.wait(Duration::from_secs(10)).await,
                JobStatus::Done { .. }
            ));
        }
        assert_eq!(harness.dispatcher.pending_count(), 0);

        harness.stop().await
    }

    #[tokio::test]
    async fn unknown_formats_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let harness = Harness::new(dir.path(), "exit 0\n", 1, 1).await?;

        assert!(matches!(
            harness
                .dispatcher
                .submit(&crypto::sha1_hex(b"content"), "app.bin", "fmtZ"),
            Err(StoreError::UnknownFormat(_))
        ));

        harness.stop().await
    }
}
