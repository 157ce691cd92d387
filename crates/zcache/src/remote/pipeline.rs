//! Command batching.
//!
//! A [`RemotePipeline`] queues commands locally and sends them in one round
//! trip on [`exec`](RemotePipeline::exec). Dropping a pipeline without
//! executing it sends nothing.
//!
//! The transactional flavour wraps the batch in `MULTI`/`EXEC`. Redis then
//! runs the batch without interleaving other clients, and discards all of it
//! when a command is rejected while queuing (unknown command, wrong arity) or
//! the connection drops before `EXEC`. There is no rollback: a command that
//! fails while executing (e.g. `HINCRBY` on a string) leaves the others applied.

use serde::Serialize;

use super::pool::Connector;
use crate::codec::Codec;
use crate::error::CacheResult;
use crate::keys::KeyPrefix;
use crate::ttl::Ttl;

/// A batch of Redis commands, each key namespaced like the owning cache.
pub struct RemotePipeline<C: Codec> {
    connector: Connector,
    prefix: KeyPrefix,
    codec: C,
    pipe: redis::Pipeline,
    transactional: bool,
    queued: usize,
}

impl<C: Codec> RemotePipeline<C> {
    pub(crate) fn new(
        connector: Connector,
        prefix: KeyPrefix,
        codec: C,
        transactional: bool,
    ) -> Self {
        let mut pipe = redis::pipe();
        if transactional {
            pipe.atomic();
        }
        Self {
            connector,
            prefix,
            codec,
            pipe,
            transactional,
            queued: 0,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    fn cmd(&self, command: &'static str, key: &str) -> redis::Cmd {
        let mut cmd = redis::cmd(command);
        cmd.arg(self.prefix.full_key(key));
        cmd
    }

    fn queue(&mut self, cmd: redis::Cmd) -> &mut Self {
        self.pipe.add_command(cmd);
        self.queued += 1;
        self
    }

    pub fn incr_by(&mut self, key: &str, delta: i64) -> &mut Self {
        let mut cmd = self.cmd("INCRBY", key);
        cmd.arg(delta);
        self.queue(cmd)
    }

    pub fn hincr_by(&mut self, key: &str, field: &str, delta: i64) -> &mut Self {
        let mut cmd = self.cmd("HINCRBY", key);
        cmd.arg(field).arg(delta);
        self.queue(cmd)
    }

    /// Queue an `HSET`; the value is encoded now, so codec errors surface here.
    pub fn hset<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        field: &str,
        value: &T,
    ) -> CacheResult<&mut Self> {
        let mut cmd = self.cmd("HSET", key);
        cmd.arg(field).arg(self.codec.encode(value)?);
        Ok(self.queue(cmd))
    }

    pub fn hset_nx<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        field: &str,
        value: &T,
    ) -> CacheResult<&mut Self> {
        let mut cmd = self.cmd("HSETNX", key);
        cmd.arg(field).arg(self.codec.encode(value)?);
        Ok(self.queue(cmd))
    }

    pub fn hexists(&mut self, key: &str, field: &str) -> &mut Self {
        let mut cmd = self.cmd("HEXISTS", key);
        cmd.arg(field);
        self.queue(cmd)
    }

    /// Queue an `HGETALL`; the reply holds encoded field values, decode them
    /// with the cache's codec.
    pub fn hgetall(&mut self, key: &str) -> &mut Self {
        let cmd = self.cmd("HGETALL", key);
        self.queue(cmd)
    }

    /// Queue a `PEXPIRE`, or `PERSIST` for `Ttl::Persistent`.
    pub fn expire(&mut self, key: &str, ttl: Ttl) -> &mut Self {
        let cmd = match ttl.as_millis() {
            Some(ms) => {
                let mut cmd = self.cmd("PEXPIRE", key);
                cmd.arg(ms);
                cmd
            }
            None => self.cmd("PERSIST", key),
        };
        self.queue(cmd)
    }

    pub fn del(&mut self, key: &str) -> &mut Self {
        let cmd = self.cmd("DEL", key);
        self.queue(cmd)
    }

    /// Queue any other single-key command; `key` is prefixed, `args` follow it verbatim.
    pub fn command<A: redis::ToRedisArgs>(
        &mut self,
        command: &'static str,
        key: &str,
        args: A,
    ) -> &mut Self {
        let mut cmd = self.cmd(command, key);
        cmd.arg(args);
        self.queue(cmd)
    }

    /// Send every queued command in one round trip.
    ///
    /// `R` receives one reply per queued command, typically a tuple
    /// (`(i64, bool)`) or `Vec<redis::Value>`; use `()` to discard replies.
    pub async fn exec<R: redis::FromRedisValue>(self) -> CacheResult<R> {
        let operation = if self.transactional { "EXEC" } else { "PIPELINE" };
        let mut conn = self.connector.get().await?;
        let result = self
            .connector
            .timed(operation, self.pipe.query_async(&mut conn))
            .await;
        match &result {
            Ok(_) => tracing::debug!(
                commands = self.queued,
                transactional = self.transactional,
                "pipeline executed"
            ),
            Err(e) => tracing::warn!(commands = self.queued, error = %e, "pipeline failed"),
        }
        result
    }
}
