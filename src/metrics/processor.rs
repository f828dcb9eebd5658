use super::{MetricsEntry, MetricsSink, LATENCY_HISTOGRAM_BUCKETS};
use redis::aio::ConnectionLike;
use redis::{AsyncCommands, RedisResult};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Redis keys the processor writes to
pub mod keys {
    /// Hash of dead-letter queue sizes by topic
    pub const DLQ_BACKLOG: &str = "courier:metrics:dlq:backlog";

    /// Hash of publish outcomes (`success`, `failure`)
    pub fn published(topic: &str) -> String {
        format!("courier:metrics:{}:published", topic)
    }

    /// Hash of process outcomes by consumer group, fields are `<group>:<outcome>`
    pub fn processed(topic: &str) -> String {
        format!("courier:metrics:{}:processed", topic)
    }

    /// Hash of retried attempts by attempt number
    pub fn retries(topic: &str) -> String {
        format!("courier:metrics:{}:retries", topic)
    }

    /// Hash of dead-lettered messages by error kind
    pub fn dead_lettered(topic: &str) -> String {
        format!("courier:metrics:{}:dead_lettered", topic)
    }

    /// Keys of a latency histogram: bucket hash, observation count and sum in milliseconds
    pub fn latency(topic: &str, operation: &str) -> (String, String, String) {
        let base = format!("courier:metrics:{}:latency:{}", topic, operation);
        (
            format!("{}:buckets", base),
            format!("{}:count", base),
            format!("{}:sum", base),
        )
    }
}

/// Sink persisting observations into Redis hashes
///
/// Recording only pushes into an unbounded channel. A background task drains it and issues the
/// Redis commands, so slow or unavailable Redis instances never delay message processing.
#[derive(Clone)]
pub struct RedisMetricsProcessor {
    tx: UnboundedSender<MetricsEntry>,
}

/// Background task of a [`RedisMetricsProcessor`]
pub struct MetricsWorker {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MetricsWorker {
    /// Stops accepting observations and waits until the queued ones have been written.
    ///
    /// Returns `false` if the deadline passed first, in which case the task is aborted and the
    /// remaining observations are lost.
    pub async fn finish(self, deadline: Instant) -> bool {
        let MetricsWorker { shutdown, mut task } = self;

        // Fails only if the task already terminated
        shutdown.send(()).ok();

        match timeout_at(deadline, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Metrics processor did not drain in time");
                task.abort();
                false
            }
        }
    }
}

impl RedisMetricsProcessor {
    /// Spawns the processing task on the given connection.
    /// It terminates once every clone of the returned processor has been dropped or the
    /// worker has been [finished](MetricsWorker::finish) or dropped.
    pub fn spawn<C>(con: C) -> (Self, MetricsWorker)
    where
        C: ConnectionLike + Send + 'static,
    {
        let (tx, rx) = unbounded_channel();
        let (shutdown, signal) = oneshot::channel();
        let task = tokio::spawn(process(con, rx, signal));

        (Self { tx }, MetricsWorker { shutdown, task })
    }
}

impl MetricsSink for RedisMetricsProcessor {
    fn record(&self, entry: MetricsEntry) {
        if self.tx.send(entry).is_err() {
            debug!("Metrics processor has terminated, dropping entry");
        }
    }
}

async fn process<C: ConnectionLike + Send>(
    mut con: C,
    mut rx: UnboundedReceiver<MetricsEntry>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut accepting = true;

    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => {
                    if let Err(e) = process_entry(&mut con, entry).await {
                        warn!(error = %e, "Failed to update metric");
                    }
                }
                None => break,
            },
            _ = &mut shutdown, if accepting => {
                // Queued entries are still delivered until the channel is empty
                accepting = false;
                rx.close();
            }
        }
    }

    debug!("Metrics processor terminated");
}

async fn process_entry<C: ConnectionLike + Send>(
    con: &mut C,
    entry: MetricsEntry,
) -> RedisResult<()> {
    match entry {
        MetricsEntry::Published {
            topic,
            latency,
            outcome,
        } => {
            con.hincr::<_, _, _, ()>(keys::published(&topic), outcome.to_string(), 1)
                .await?;
            process_histogram_entry(con, &topic, "publish", latency).await
        }
        MetricsEntry::Processed {
            topic,
            group,
            latency,
            outcome,
        } => {
            let field = format!("{}:{}", group, outcome);
            con.hincr::<_, _, _, ()>(keys::processed(&topic), field, 1)
                .await?;
            process_histogram_entry(con, &topic, "process", latency).await
        }
        MetricsEntry::RetryAttempted { topic, attempt } => {
            con.hincr::<_, _, _, ()>(keys::retries(&topic), attempt, 1)
                .await
        }
        MetricsEntry::DeadLettered { topic, kind } => {
            con.hincr::<_, _, _, ()>(keys::dead_lettered(&topic), kind.as_str(), 1)
                .await
        }
        MetricsEntry::DlqBacklog { topic, size } => {
            con.hset::<_, _, _, ()>(keys::DLQ_BACKLOG, topic, size)
                .await
        }
    }
}

async fn process_histogram_entry<C: ConnectionLike + Send>(
    con: &mut C,
    topic: &str,
    operation: &str,
    latency: Duration,
) -> RedisResult<()> {
    let (buckets_key, count_key, sum_key) = keys::latency(topic, operation);
    let millis = latency.as_millis() as u64;

    for bucket in LATENCY_HISTOGRAM_BUCKETS.iter() {
        if *bucket > millis {
            con.hincr::<_, _, _, ()>(&buckets_key, *bucket, 1).await?;
        }
    }

    con.hincr::<_, _, _, ()>(&buckets_key, "+Inf", 1).await?;
    con.incr::<_, _, ()>(&count_key, 1).await?;
    con.incr::<_, _, ()>(&sum_key, millis).await
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use redis::{Cmd, Pipeline, RedisFuture, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Connection answering every command after a short delay, counting them
    #[derive(Clone, Default)]
    struct CountingConnection {
        commands: Arc<AtomicUsize>,
    }

    impl ConnectionLike for CountingConnection {
        fn req_packed_command<'a>(&'a mut self, _cmd: &'a Cmd) -> RedisFuture<'a, Value> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                self.commands.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Okay)
            })
        }

        fn req_packed_commands<'a>(
            &'a mut self,
            _cmd: &'a Pipeline,
            _offset: usize,
            _count: usize,
        ) -> RedisFuture<'a, Vec<Value>> {
            Box::pin(async move { Ok(Vec::new()) })
        }

        fn get_db(&self) -> i64 {
            0
        }
    }

    fn retry(attempt: u32) -> MetricsEntry {
        MetricsEntry::RetryAttempted {
            topic: "activity.created".into(),
            attempt,
        }
    }

    #[tokio::test]
    async fn write_queued_entries_before_finishing() {
        let con = CountingConnection::default();
        let (processor, worker) = RedisMetricsProcessor::spawn(con.clone());

        for attempt in 1..=20 {
            processor.record(retry(attempt));
        }

        assert!(worker.finish(Instant::now() + Duration::from_secs(5)).await);
        assert_eq!(con.commands.load(Ordering::SeqCst), 20);

        // Late observations are dropped quietly
        processor.record(retry(21));
        assert_eq!(con.commands.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn abort_when_draining_takes_too_long() {
        let con = CountingConnection::default();
        let (processor, worker) = RedisMetricsProcessor::spawn(con.clone());

        for attempt in 1..=1000 {
            processor.record(retry(attempt));
        }

        assert!(!worker.finish(Instant::now() + Duration::from_millis(20)).await);
        assert!(con.commands.load(Ordering::SeqCst) < 1000);
    }

    #[test]
    fn namespace_keys_by_topic() {
        assert_eq!(
            keys::published("activity.created"),
            "courier:metrics:activity.created:published"
        );
        assert_eq!(
            keys::latency("a.b", "process").0,
            "courier:metrics:a.b:latency:process:buckets"
        );
    }
}
