//! Per-destination delivery serialization.
//!
//! Each destination gets one worker task fed by an unbounded channel. Jobs
//! run strictly one at a time in enqueue order; a failed (or panicking) job
//! resolves only its own completion and the worker moves on to the next one.
//! Different destinations have independent workers.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Mutex;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

use watchpost_common::error::CheckError;

use crate::format::mask_url;

type DeliveryTask = Pin<Box<dyn Future<Output = Result<(), CheckError>> + Send>>;

struct Job {
    task: DeliveryTask,
    reply: oneshot::Sender<Result<(), CheckError>>,
}

/// Ordered delivery queues keyed by destination transport address.
pub struct NotificationSerializer {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
}

impl NotificationSerializer {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Append `task` to the destination's queue.
    ///
    /// The task is queued immediately, so call order is execution order even
    /// if the returned completions are awaited later or in a different order.
    /// The task itself is not polled until every earlier task for the same
    /// destination has finished.
    pub fn enqueue<F>(
        &self,
        destination: &str,
        task: F,
    ) -> impl Future<Output = Result<(), CheckError>> + Send + 'static
    where
        F: Future<Output = Result<(), CheckError>> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        self.dispatch(
            destination,
            Job {
                task: Box::pin(task),
                reply,
            },
        );

        let destination = destination.to_string();
        async move {
            receiver.await.unwrap_or_else(|_| {
                Err(CheckError::transport(
                    mask_url(&destination),
                    "delivery worker stopped before running the task",
                ))
            })
        }
    }

    /// Number of destinations that have a worker.
    pub fn destination_count(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn dispatch(&self, destination: &str, job: Job) {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let sender = queues
            .entry(destination.to_string())
            .or_insert_with(|| spawn_worker(destination));

        if let Err(mpsc::error::SendError(job)) = sender.send(job) {
            tracing::warn!(
                destination = %mask_url(destination),
                "Delivery worker was gone, starting a new one"
            );
            let fresh = spawn_worker(destination);
            // A send failure here drops the reply sender, which the caller sees as an error.
            let _ = fresh.send(job);
            queues.insert(destination.to_string(), fresh);
        }
    }
}

impl Default for NotificationSerializer {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_worker(destination: &str) -> mpsc::UnboundedSender<Job> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
    let destination = destination.to_string();

    tokio::spawn(async move {
        while let Some(job) = receiver.recv().await {
            let result = match AssertUnwindSafe(job.task).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(destination = %mask_url(&destination), "Delivery task panicked");
                    Err(CheckError::transport(
                        mask_url(&destination),
                        "delivery task panicked",
                    ))
                }
            };
            // The caller may have stopped waiting; the queue advances either way.
            let _ = job.reply.send(result);
        }
        tracing::trace!(destination = %mask_url(&destination), "Delivery worker stopped");
    });

    sender
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    fn position(log: &Log, entry: &str) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("missing log entry {entry}"))
    }

    fn timed_task(
        log: &Log,
        name: &'static str,
        delay: Duration,
        outcome: Result<(), &'static str>,
    ) -> impl Future<Output = Result<(), CheckError>> + Send + 'static {
        let log = log.clone();
        async move {
            record(&log, &format!("{name}-start"));
            tokio::time::sleep(delay).await;
            record(&log, &format!("{name}-end"));
            outcome.map_err(|reason| CheckError::transport("test://dest", reason))
        }
    }

    #[tokio::test]
    async fn test_same_destination_runs_in_order() {
        let serializer = NotificationSerializer::new();
        let log: Log = Arc::default();

        let slow = serializer.enqueue(
            "slack://a",
            timed_task(&log, "t1", Duration::from_millis(60), Ok(())),
        );
        let fast = serializer.enqueue(
            "slack://a",
            timed_task(&log, "t2", Duration::ZERO, Ok(())),
        );

        // Await in reverse order: execution order must still follow enqueue order.
        assert!(fast.await.is_ok());
        assert!(slow.await.is_ok());

        assert_eq!(
            *log.lock().unwrap(),
            vec!["t1-start", "t1-end", "t2-start", "t2-end"]
        );
        assert_eq!(serializer.destination_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_following_tasks() {
        let serializer = NotificationSerializer::new();
        let log: Log = Arc::default();

        let first = serializer.enqueue(
            "slack://a",
            timed_task(&log, "t1", Duration::from_millis(20), Err("boom")),
        );
        let second = serializer.enqueue(
            "slack://a",
            timed_task(&log, "t2", Duration::ZERO, Ok(())),
        );

        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap_err().to_string().contains("boom"));
        assert!(second.is_ok());
        assert!(position(&log, "t1-end") < position(&log, "t2-start"));
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported_and_queue_advances() {
        let serializer = NotificationSerializer::new();
        let log: Log = Arc::default();

        let panicking = serializer.enqueue("slack://a", async {
            if true {
                panic!("transport exploded");
            }
            Ok::<(), CheckError>(())
        });
        let next = serializer.enqueue(
            "slack://a",
            timed_task(&log, "t2", Duration::ZERO, Ok(())),
        );

        let err = panicking.await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert!(next.await.is_ok());
    }

    #[tokio::test]
    async fn test_destinations_are_independent() {
        let serializer = NotificationSerializer::new();
        let log: Log = Arc::default();

        let slow = serializer.enqueue(
            "slack://a",
            timed_task(&log, "a", Duration::from_millis(150), Ok(())),
        );
        let fast = serializer.enqueue(
            "discord://b",
            timed_task(&log, "b", Duration::ZERO, Ok(())),
        );

        let (slow, fast) = tokio::join!(slow, fast);
        assert!(slow.is_ok() && fast.is_ok());
        assert!(position(&log, "b-end") < position(&log, "a-end"));
        assert_eq!(serializer.destination_count(), 2);
    }
}
