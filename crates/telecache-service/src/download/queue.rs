//! Hand-off of retrieval jobs into the session runtime, and of their results back out.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ByteStream, FetchError};

/// Number of messages a job may buffer before the runtime waits for the consumer.
const RESULT_CAPACITY: usize = 16;

/// A message on a job's result channel.
#[derive(Debug)]
pub enum JobMessage {
    /// The next chunk of the object, in order.
    Chunk(Bytes),
    /// The job failed. Always followed by [`End`](Self::End).
    Failed(FetchError),
    /// The job is done. Sent exactly once, as the last message.
    End,
}

/// A request to stream one object through the session runtime into a cache file.
#[derive(Debug)]
pub struct RetrievalJob {
    pub object_id: String,
    /// The cache file to write to.
    pub destination: PathBuf,
    pub(super) results: mpsc::Sender<JobMessage>,
    pub(super) cancel: CancellationToken,
}

impl RetrievalJob {
    /// Creates a job along with the receiving end of its result channel.
    pub fn new(object_id: impl Into<String>, destination: PathBuf) -> (Self, JobReceiver) {
        let (results, rx) = mpsc::channel(RESULT_CAPACITY);
        let cancel = CancellationToken::new();

        let job = Self {
            object_id: object_id.into(),
            destination,
            results,
            cancel: cancel.clone(),
        };
        (job, JobReceiver { rx, cancel })
    }

    /// Whether the consumer has given up on this job.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.results.is_closed()
    }

    /// Terminates the job with `error`.
    pub(super) async fn fail(self, error: FetchError) {
        // the consumer may be gone already
        let _ = self.results.send(JobMessage::Failed(error)).await;
        let _ = self.results.send(JobMessage::End).await;
    }
}

/// The receiving end of a job's result channel.
///
/// Dropping the receiver cancels the job.
#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::Receiver<JobMessage>,
    cancel: CancellationToken,
}

impl JobReceiver {
    /// Receives the next message, `None` once the runtime has dropped the job.
    pub async fn recv(&mut self) -> Option<JobMessage> {
        self.rx.recv().await
    }

    /// Blocking variant of [`recv`](Self::recv) for plain threads.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_recv(&mut self) -> Option<JobMessage> {
        self.rx.blocking_recv()
    }

    /// Asks the runtime to stop working on this job.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Converts the messages into a byte stream.
    ///
    /// The stream ends after [`JobMessage::End`]. A channel that closes without `End` yields a
    /// [`FetchError::Session`] error.
    pub fn into_byte_stream(self) -> ByteStream {
        let stream = stream::unfold(Some(self), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.recv().await {
                Some(JobMessage::Chunk(chunk)) => Some((Ok(chunk), Some(receiver))),
                Some(JobMessage::Failed(err)) => Some((Err(err), Some(receiver))),
                Some(JobMessage::End) => None,
                None => Some((
                    Err(FetchError::Session("session runtime dropped the job".into())),
                    None,
                )),
            }
        });
        stream.boxed()
    }
}

impl Stream for JobReceiver {
    type Item = JobMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for JobReceiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The bounded queue of jobs waiting for the session runtime.
///
/// Producers never block: a full queue is reported as [`FetchError::QueueFull`].
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<RetrievalJob>,
}

impl WorkQueue {
    /// Creates a queue holding up to `capacity` jobs, and the runtime's end of it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RetrievalJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Hands `job` to the runtime.
    pub fn enqueue(&self, job: RetrievalJob) -> Result<(), FetchError> {
        self.tx.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => FetchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => FetchError::RuntimeNotStarted,
        })
    }
}
