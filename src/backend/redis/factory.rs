use super::super::BackendError;
use crate::config::BackendConfig;
use redis::aio::{Connection, ConnectionLike, ConnectionManager};
use redis::{Client, Cmd, IntoConnectionInfo, Pipeline, RedisFuture, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Variant for redis connections
pub enum RedisConnectionVariant {
    /// Individual connection that allows for blocking commands without disturbing other users.
    /// It is taken from an idle pool and returned to it once dropped, so long-running blocking
    /// reads never stall the requests of other components.
    Owned,
    /// Connection that can be shared between multiple users and generally does not permit blocking commands
    Multiplexed,
}

/// Connection handed out by the [`RedisFactory`]
pub enum RedisConnection {
    /// Exclusive connection, see [`RedisConnectionVariant::Owned`]
    Owned(PooledConnection),
    /// Shared connection, see [`RedisConnectionVariant::Multiplexed`]
    Multiplexed(ConnectionManager),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            RedisConnection::Owned(con) => con.req_packed_command(cmd),
            RedisConnection::Multiplexed(con) => con.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            RedisConnection::Owned(con) => con.req_packed_commands(cmd, offset, count),
            RedisConnection::Multiplexed(con) => con.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Owned(con) => con.get_db(),
            RedisConnection::Multiplexed(con) => con.get_db(),
        }
    }
}

type IdlePool = Arc<Mutex<Vec<Connection>>>;

/// Owned connection which returns to the idle pool when dropped
pub struct PooledConnection {
    con: Option<Connection>,
    pool: IdlePool,
    capacity: usize,
}

impl PooledConnection {
    /// Prevents the connection from being reused, e.g. after an I/O error left it in an unknown state
    pub fn discard(mut self) {
        self.con.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(con) = self.con.take() {
            if let Ok(mut idle) = self.pool.lock() {
                if idle.len() < self.capacity {
                    idle.push(con);
                }
            }
        }
    }
}

impl ConnectionLike for PooledConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self.con.as_mut() {
            Some(con) => con.req_packed_command(cmd),
            None => Box::pin(async { Err(discarded()) }),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self.con.as_mut() {
            Some(con) => con.req_packed_commands(cmd, offset, count),
            None => Box::pin(async { Err(discarded()) }),
        }
    }

    fn get_db(&self) -> i64 {
        self.con.as_ref().map(|con| con.get_db()).unwrap_or_default()
    }
}

fn discarded() -> redis::RedisError {
    (redis::ErrorKind::IoError, "connection has been discarded").into()
}

/// Factory for redis connections of different [types](RedisConnectionVariant)
///
/// Keeps one multiplexed [`ConnectionManager`] which reconnects on its own and a bounded pool of
/// idle dedicated connections for blocking commands.
#[derive(Clone)]
pub struct RedisFactory {
    client: Client,
    shared: ConnectionManager,
    idle: IdlePool,
    pool_size: usize,
    connect_timeout: Duration,
}

impl RedisFactory {
    /// Opens the shared connection using the given configuration
    pub async fn connect(config: &BackendConfig) -> Result<Self, BackendError> {
        let mut info = config.url.as_str().into_connection_info()?;

        if config.username.is_some() {
            info.redis.username = config.username.clone();
        }

        if config.password.is_some() {
            info.redis.password = config.password.clone();
        }

        let client = Client::open(info)?;
        let shared = tokio::time::timeout(
            config.connect_timeout,
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| BackendError::Timeout(config.connect_timeout))??;

        debug!(url = %config.url, pool_size = config.pool_size, "Connected to redis");

        Ok(Self {
            client,
            shared,
            idle: Arc::new(Mutex::new(Vec::with_capacity(config.pool_size))),
            pool_size: config.pool_size,
            connect_timeout: config.connect_timeout,
        })
    }

    /// Establishes a new connection, retrieves one from the pool, or clones the shared one
    pub async fn connection(
        &self,
        variant: RedisConnectionVariant,
    ) -> Result<RedisConnection, BackendError> {
        match variant {
            RedisConnectionVariant::Multiplexed => {
                Ok(RedisConnection::Multiplexed(self.shared.clone()))
            }
            RedisConnectionVariant::Owned => Ok(RedisConnection::Owned(self.owned().await?)),
        }
    }

    /// Retrieves an idle dedicated connection or opens a new one
    pub async fn owned(&self) -> Result<PooledConnection, BackendError> {
        let recycled = self.idle.lock().ok().and_then(|mut idle| idle.pop());

        let con = match recycled {
            Some(con) => con,
            None => {
                trace!("Opening dedicated redis connection");
                tokio::time::timeout(self.connect_timeout, self.client.get_async_connection())
                    .await
                    .map_err(|_| BackendError::Timeout(self.connect_timeout))??
            }
        };

        Ok(PooledConnection {
            con: Some(con),
            pool: self.idle.clone(),
            capacity: self.pool_size,
        })
    }

    /// Clone of the shared multiplexed connection
    pub fn multiplexed(&self) -> ConnectionManager {
        self.shared.clone()
    }

    /// Drops all idle dedicated connections
    pub fn drain(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }
}
