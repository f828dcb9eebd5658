use super::super::{
    AppendRecord, BackendError, ReadCursor, StartPosition, StreamBackend, StreamEntry,
};
use super::{
    RedisConnectionVariant, RedisFactory, BUSY_GROUP, NO_GROUP, STREAM_ID_ADDITIONS, STREAM_ID_HEAD,
    STREAM_ID_NEW, STREAM_ID_TAIL,
};
use crate::config::BackendConfig;
use async_trait::async_trait;
use redis::streams::{
    StreamId, StreamMaxlen, StreamPendingReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::convert::TryInto;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Backend implementation using [Redis Streams](https://redis.io/topics/streams-intro)
///
/// Non-blocking commands share one multiplexed connection. Blocking group reads each take a
/// dedicated connection from the pool of the [`RedisFactory`] so they never stall other users.
pub struct RedisBackend {
    factory: RedisFactory,
    response_timeout: Duration,
    closed: AtomicBool,
}

impl RedisBackend {
    /// Connects to the server described by the configuration
    pub async fn connect(config: &BackendConfig) -> Result<Self, BackendError> {
        Ok(Self::new(
            RedisFactory::connect(config).await?,
            config.response_timeout,
        ))
    }

    /// Creates a new instance with a given [`RedisFactory`]
    pub fn new(factory: RedisFactory, response_timeout: Duration) -> Self {
        Self {
            factory,
            response_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Factory used by this backend, e.g. to share its connections with a metrics processor
    pub fn factory(&self) -> &RedisFactory {
        &self.factory
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    async fn respond<T, F>(&self, limit: Duration, request: F) -> Result<T, BackendError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(limit, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BackendError::Timeout(limit)),
        }
    }

    async fn shared(&self) -> Result<super::RedisConnection, BackendError> {
        self.ensure_open()?;
        self.factory
            .connection(RedisConnectionVariant::Multiplexed)
            .await
    }
}

/// Translates the reply of reading from a vanished stream or group
fn missing_group(error: BackendError, stream: &str, group: &str) -> BackendError {
    match error {
        BackendError::Redis(e) if e.code() == Some(NO_GROUP) => BackendError::NoGroup {
            stream: stream.to_owned(),
            group: group.to_owned(),
        },
        other => other,
    }
}

fn into_entry(entry: StreamId) -> StreamEntry {
    let fields = entry
        .map
        .iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|value| (key.to_owned(), value))
        })
        .collect::<HashMap<_, _>>();

    StreamEntry {
        id: entry.id,
        fields,
    }
}

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn append(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
        max_len: Option<usize>,
    ) -> Result<String, BackendError> {
        let mut con = self.shared().await?;

        match max_len {
            Some(limit) => {
                let request = con.xadd_maxlen::<_, _, _, _, String>(
                    stream,
                    StreamMaxlen::Approx(limit),
                    STREAM_ID_NEW,
                    fields.as_slice(),
                );
                self.respond(self.response_timeout, request).await
            }
            None => {
                let request =
                    con.xadd::<_, _, _, _, String>(stream, STREAM_ID_NEW, fields.as_slice());
                self.respond(self.response_timeout, request).await
            }
        }
    }

    async fn append_batch(
        &self,
        records: Vec<AppendRecord>,
        max_len: Option<usize>,
    ) -> Result<Vec<String>, BackendError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();

        for record in records.iter() {
            pipe.cmd("XADD").arg(&record.stream);

            if let Some(limit) = max_len {
                pipe.arg("MAXLEN").arg("~").arg(limit);
            }

            pipe.arg(STREAM_ID_NEW);

            for (field, value) in record.fields.iter() {
                pipe.arg(field).arg(value);
            }
        }

        let mut con = self.shared().await?;
        self.respond(
            self.response_timeout,
            pipe.query_async::<_, Vec<String>>(&mut con),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BackendError> {
        let start_id = match start {
            StartPosition::Beginning => STREAM_ID_HEAD,
            StartPosition::End => STREAM_ID_TAIL,
        };

        let mut con = self.shared().await?;
        let request = con.xgroup_create_mkstream::<_, _, _, ()>(stream, group, start_id);

        match self.respond(self.response_timeout, request).await {
            Err(BackendError::Redis(e)) if e.code() == Some(BUSY_GROUP) => {
                debug!("Consumer group already exists");
                Ok(())
            }
            other => other,
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BackendError> {
        self.ensure_open()?;

        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        let (id, limit) = match cursor {
            ReadCursor::Pending(after) => (after, self.response_timeout),
            ReadCursor::New if block.is_zero() => {
                (STREAM_ID_ADDITIONS.to_owned(), self.response_timeout)
            }
            ReadCursor::New => {
                let millis: usize = block.as_millis().try_into().unwrap_or(usize::MAX);
                options = options.block(millis);
                (STREAM_ID_ADDITIONS.to_owned(), block + self.response_timeout)
            }
        };

        // Blocking reads must not be issued on the multiplexed connection
        let mut con = self.factory.owned().await?;
        let keys = [stream];
        let ids = [id.as_str()];
        let request = con.xread_options::<_, _, Option<StreamReadReply>>(&keys, &ids, &options);

        let reply = match self.respond(limit, request).await {
            Ok(reply) => reply,
            Err(e) => {
                let e = missing_group(e, stream, group);
                if let BackendError::NoGroup { .. } = e {
                    return Err(e);
                }

                warn!(error = %e, stream, "Discarding connection after failed read");
                con.discard();
                return Err(e);
            }
        };

        let entries = reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .filter(|key| key.key == stream)
            .flat_map(|key| key.ids)
            .map(into_entry)
            .collect();

        Ok(entries)
    }

    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        ids: &[String],
    ) -> Result<usize, BackendError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut con = self.shared().await?;
        let request = con.xack::<_, _, _, usize>(stream, group, ids);
        self.respond(self.response_timeout, request).await
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<usize, BackendError> {
        let mut con = self.shared().await?;
        let request = con.xpending::<_, _, StreamPendingReply>(stream, group);
        let reply = self.respond(self.response_timeout, request).await?;

        Ok(reply.count())
    }

    async fn range(
        &self,
        stream: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, BackendError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // XRANGE has no native offset, the leading entries are fetched and skipped
        let mut con = self.shared().await?;
        let request = con.xrange_count::<_, _, _, _, StreamRangeReply>(
            stream,
            "-",
            "+",
            offset.saturating_add(limit),
        );
        let reply = self.respond(self.response_timeout, request).await?;

        Ok(reply
            .ids
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(into_entry)
            .collect())
    }

    async fn get(&self, stream: &str, id: &str) -> Result<Option<StreamEntry>, BackendError> {
        let mut con = self.shared().await?;
        let request = con.xrange::<_, _, _, StreamRangeReply>(stream, id, id);
        let reply = self.respond(self.response_timeout, request).await?;

        Ok(reply.ids.into_iter().next().map(into_entry))
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<usize, BackendError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut con = self.shared().await?;
        let request = con.xdel::<_, _, usize>(stream, ids);
        self.respond(self.response_timeout, request).await
    }

    async fn len(&self, stream: &str) -> Result<usize, BackendError> {
        let mut con = self.shared().await?;
        let request = con.xlen::<_, usize>(stream);
        self.respond(self.response_timeout, request).await
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize, BackendError> {
        let mut con = self.shared().await?;
        let request = con.xtrim::<_, usize>(stream, StreamMaxlen::Equals(max_len));
        self.respond(self.response_timeout, request).await
    }

    async fn remove(&self, stream: &str) -> Result<(), BackendError> {
        let mut con = self.shared().await?;
        let request = con.del::<_, ()>(stream);
        self.respond(self.response_timeout, request).await
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let mut con = self.shared().await?;
        let mut ping = redis::cmd("PING");
        let request = ping.query_async::<_, String>(&mut con);
        self.respond(self.response_timeout, request).await?;

        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        self.factory.drain();
        debug!("Closed redis backend");

        Ok(())
    }
}
