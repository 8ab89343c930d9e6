//! The session runtime.
//!
//! The [`ObjectSession`] lives on one dedicated OS thread running a single-threaded tokio
//! runtime. Any thread can [`submit`](SessionRuntime::submit) work to it, and every job gets its
//! own result channel. Jobs are serviced concurrently on the runtime's event loop, and a failing
//! job never takes the loop down.

use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Mutex, PoisonError, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use crate::caching::CacheWriter;

use super::FetchError;
use super::queue::{JobMessage, JobReceiver, RetrievalJob, WorkQueue};
use super::session::{ObjectSession, SessionFactory};

struct RuntimeHandle {
    queue: WorkQueue,
    thread: JoinHandle<()>,
}

impl RuntimeHandle {
    fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }
}

/// Owns the session thread and the queue feeding it.
pub struct SessionRuntime {
    factory: SessionFactory,
    queue_capacity: usize,
    connect_timeout: Duration,
    handle: Mutex<Option<RuntimeHandle>>,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("queue_capacity", &self.queue_capacity)
            .field("connect_timeout", &self.connect_timeout)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SessionRuntime {
    /// Creates a runtime that is not started yet.
    ///
    /// `factory` is invoked on the runtime thread to create the session. A connect attempt that
    /// takes longer than `connect_timeout` fails the job it was made for.
    pub fn new(factory: SessionFactory, queue_capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            factory,
            queue_capacity,
            connect_timeout,
            handle: Mutex::new(None),
        }
    }

    /// Starts the runtime thread, unless it is already running.
    ///
    /// Returns once the event loop and the session exist, or with the error that kept them from
    /// being created.
    pub fn start(&self) -> io::Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.as_ref().is_some_and(RuntimeHandle::is_alive) {
            return Ok(());
        }

        let (queue, jobs) = WorkQueue::new(self.queue_capacity);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let factory = self.factory.clone();
        let connect_timeout = self.connect_timeout;
        let thread = thread::Builder::new()
            .name("telecache-session".into())
            .spawn(move || run_loop(factory, jobs, connect_timeout, ready_tx))?;

        let startup = match ready_rx.recv() {
            Ok(result) => result,
            // the thread panicked before it was ready, e.g. in the session factory
            Err(_) => Err(io::Error::other("session runtime exited during startup")),
        };
        if let Err(err) = startup {
            if thread.join().is_err() {
                tracing::error!("Session runtime panicked during startup");
            }
            return Err(err);
        }

        tracing::info!("Started session runtime");
        *handle = Some(RuntimeHandle { queue, thread });
        Ok(())
    }

    /// Whether the runtime thread is alive.
    pub fn is_running(&self) -> bool {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        handle.as_ref().is_some_and(RuntimeHandle::is_alive)
    }

    /// Submits a job streaming `object_id` into the file at `destination`.
    ///
    /// Never blocks. The returned receiver yields the object's chunks as they are written.
    pub fn submit(&self, object_id: &str, destination: PathBuf) -> Result<JobReceiver, FetchError> {
        let queue = {
            let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
            match handle.as_ref() {
                Some(handle) if handle.is_alive() => handle.queue.clone(),
                _ => return Err(FetchError::RuntimeNotStarted),
            }
        };

        let (job, receiver) = RetrievalJob::new(object_id, destination);
        queue.enqueue(job)?;
        metric!(counter("session.jobs.submitted") += 1);
        Ok(receiver)
    }

    /// Closes the queue and waits for the runtime thread to exit.
    ///
    /// Jobs that are still running are dropped, their receivers see a closed channel.
    pub fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(RuntimeHandle { queue, thread }) = handle {
            drop(queue);
            if thread.join().is_err() {
                tracing::error!("Session runtime panicked");
            }
        }
    }
}

fn run_loop(
    factory: SessionFactory,
    mut jobs: mpsc::Receiver<RetrievalJob>,
    connect_timeout: Duration,
    ready: std_mpsc::Sender<io::Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to create session runtime"
            );
            let _ = ready.send(Err(err));
            return;
        }
    };

    let session: Rc<dyn ObjectSession> = Rc::from(factory());
    let _ = ready.send(Ok(()));

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        while let Some(job) = jobs.recv().await {
            if !session.is_connected() {
                match connect(&*session, &job, connect_timeout).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(object_id = %job.object_id, "Job cancelled while connecting");
                        let _ = job.results.send(JobMessage::End).await;
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Failed to connect session"
                        );
                        metric!(counter("session.connect.failed") += 1);
                        job.fail(err).await;
                        continue;
                    }
                }
            }
            tokio::task::spawn_local(run_job(session.clone(), job));
        }

        tracing::info!("Session runtime stopped");
    });
}

/// Connects the session on behalf of `job`.
///
/// Returns `false` if the job was cancelled before the session was connected.
async fn connect(
    session: &dyn ObjectSession,
    job: &RetrievalJob,
    timeout: Duration,
) -> Result<bool, FetchError> {
    tokio::select! {
        biased;
        _ = job.cancel.cancelled() => Ok(false),
        result = tokio::time::timeout(timeout, session.connect()) => match result {
            Ok(result) => result.map(|()| true),
            Err(_) => Err(FetchError::Session(format!(
                "connecting timed out after {}s",
                timeout.as_secs_f64()
            ))),
        },
    }
}

async fn run_job(session: Rc<dyn ObjectSession>, job: RetrievalJob) {
    let start = Instant::now();
    let object_id = job.object_id.clone();

    match transfer(&*session, &job).await {
        Ok(Some(bytes)) => {
            tracing::debug!(object_id, bytes, "Session transfer completed");
            metric!(timer("session.transfer.duration") = start.elapsed(), "status" => "completed");
        }
        Ok(None) => {
            tracing::debug!(object_id, "Session transfer cancelled");
            metric!(timer("session.transfer.duration") = start.elapsed(), "status" => "cancelled");
        }
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                object_id,
                "Session transfer failed"
            );
            metric!(timer("session.transfer.duration") = start.elapsed(), "status" => err.metric_tag());
            // `fail` sends the terminating `End`
            job.fail(err).await;
            return;
        }
    }

    let _ = job.results.send(JobMessage::End).await;
}

/// Streams one object into its cache file while forwarding every chunk to the consumer.
///
/// Returns `None` if the job was cancelled. In that case, as on errors, the partial cache file
/// is removed when the writer is dropped.
async fn transfer(session: &dyn ObjectSession, job: &RetrievalJob) -> Result<Option<u64>, FetchError> {
    let mut writer = CacheWriter::create(job.destination.clone()).await?;
    let mut stream = tokio::select! {
        biased;
        _ = job.cancel.cancelled() => return Ok(None),
        stream = session.stream_object(&job.object_id) => stream?,
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => return Ok(None),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        if job.is_cancelled() {
            return Ok(None);
        }

        let chunk = chunk?;
        writer.write_chunk(&chunk).await?;
        if job.results.send(JobMessage::Chunk(chunk)).await.is_err() {
            return Ok(None);
        }
    }

    Ok(Some(writer.commit().await?))
}
