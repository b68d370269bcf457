//! Store contract used by every shard.
//!
//! A shard is a key-value store offering strings with TTL, hashes, ordered sets scored by
//! integer milliseconds, key scanning by glob pattern, and atomic execution of multi-key
//! scripts. Scripts run with exclusive access to the keyspace, so every mutating capacity
//! operation is a single [`Script`] evaluation.
//!
//! Submodules:
//! - `keyspace`: the data model and the [`ScriptContext`] view scripts operate on
//! - `memory`: the in-process [`MemoryStore`] backend

mod keyspace;
mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use keyspace::{KeyType, Keyspace, ScriptContext, ScriptError, StoredValue, ZSet};
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("script {name} failed: {source}")]
    Script {
        name: &'static str,
        #[source]
        source: ScriptError,
    },
    #[error("command {command} failed: {source}")]
    Command {
        command: &'static str,
        #[source]
        source: ScriptError,
    },
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        command: &'static str,
        reply: String,
    },
}

impl StoreError {
    /// Transport failures are retryable; anything the store evaluated and rejected is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// A server-side script. Implementations must be deterministic given the keyspace and
/// their own captured arguments; they return JSON bytes.
pub trait Script: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<Vec<u8>, ScriptError>;
}

/// Single non-scripted commands used outside of the atomic operation path.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        px: Option<i64>,
    },
    Del {
        keys: Vec<String>,
    },
    Exists {
        key: String,
    },
    Type {
        key: String,
    },
    Pttl {
        key: String,
    },
    Pexpire {
        key: String,
        ms: i64,
    },
    Hget {
        key: String,
        field: String,
    },
    Hgetall {
        key: String,
    },
    Hset {
        key: String,
        fields: Vec<(String, String)>,
    },
    Zadd {
        key: String,
        members: Vec<(String, i64)>,
    },
    Zrem {
        key: String,
        members: Vec<String>,
    },
    Zscore {
        key: String,
        member: String,
    },
    Zcard {
        key: String,
    },
    Zcount {
        key: String,
        min: i64,
        max: i64,
    },
    /// `offset` and `limit` follow `ZRANGEBYSCORE .. LIMIT offset count`
    ZrangeByScore {
        key: String,
        min: i64,
        max: i64,
        offset: usize,
        limit: Option<usize>,
    },
    ZrangeWithScores {
        key: String,
    },
    Scan {
        cursor: u64,
        pattern: String,
        count: usize,
    },
    Dump {
        key: String,
    },
    Restore {
        key: String,
        ttl_ms: i64,
        payload: Vec<u8>,
        replace: bool,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::Type { .. } => "TYPE",
            Command::Pttl { .. } => "PTTL",
            Command::Pexpire { .. } => "PEXPIRE",
            Command::Hget { .. } => "HGET",
            Command::Hgetall { .. } => "HGETALL",
            Command::Hset { .. } => "HSET",
            Command::Zadd { .. } => "ZADD",
            Command::Zrem { .. } => "ZREM",
            Command::Zscore { .. } => "ZSCORE",
            Command::Zcard { .. } => "ZCARD",
            Command::Zcount { .. } => "ZCOUNT",
            Command::ZrangeByScore { .. } => "ZRANGEBYSCORE",
            Command::ZrangeWithScores { .. } => "ZRANGE",
            Command::Scan { .. } => "SCAN",
            Command::Dump { .. } => "DUMP",
            Command::Restore { .. } => "RESTORE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Bulk(String),
    Bytes(Vec<u8>),
    Hash(BTreeMap<String, String>),
    Scored(Vec<(String, i64)>),
    Scan { cursor: u64, keys: Vec<String> },
    Type(KeyType),
}

#[async_trait]
pub trait KvClient: Send + Sync + std::fmt::Debug {
    /// Evaluates `script` atomically and returns its output.
    async fn eval(&self, script: &dyn Script) -> Result<Vec<u8>, StoreError>;

    async fn exec(&self, command: Command) -> Result<Reply, StoreError>;
}

fn unexpected(command: &'static str, reply: Reply) -> StoreError {
    StoreError::UnexpectedReply {
        command,
        reply: format!("{reply:?}"),
    }
}

/// Typed wrappers over [`KvClient::exec`].
#[async_trait]
pub trait KvClientExt: KvClient {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self
            .exec(Command::Get {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Nil => Ok(None),
            Reply::Bulk(v) => Ok(Some(v)),
            other => Err(unexpected("GET", other)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let cmd = Command::Hget {
            key: key.to_string(),
            field: field.to_string(),
        };
        match self.exec(cmd).await? {
            Reply::Nil => Ok(None),
            Reply::Bulk(v) => Ok(Some(v)),
            other => Err(unexpected("HGET", other)),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        match self
            .exec(Command::Hgetall {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Hash(v) => Ok(v),
            Reply::Nil => Ok(BTreeMap::new()),
            other => Err(unexpected("HGETALL", other)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .exec(Command::Exists {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Int(n) => Ok(n > 0),
            other => Err(unexpected("EXISTS", other)),
        }
    }

    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError> {
        match self
            .exec(Command::Type {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Type(t) => Ok(t),
            other => Err(unexpected("TYPE", other)),
        }
    }

    /// Remaining TTL in ms; -1 without expiry and -2 when missing
    async fn pttl(&self, key: &str) -> Result<i64, StoreError> {
        match self
            .exec(Command::Pttl {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Int(n) => Ok(n),
            other => Err(unexpected("PTTL", other)),
        }
    }

    async fn del(&self, keys: Vec<String>) -> Result<i64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        match self.exec(Command::Del { keys }).await? {
            Reply::Int(n) => Ok(n),
            other => Err(unexpected("DEL", other)),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        let cmd = Command::Zscore {
            key: key.to_string(),
            member: member.to_string(),
        };
        match self.exec(cmd).await? {
            Reply::Nil => Ok(None),
            Reply::Int(n) => Ok(Some(n)),
            other => Err(unexpected("ZSCORE", other)),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let cmd = Command::Zadd {
            key: key.to_string(),
            members: vec![(member.to_string(), score)],
        };
        match self.exec(cmd).await? {
            Reply::Int(_) => Ok(()),
            other => Err(unexpected("ZADD", other)),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let cmd = Command::Zrem {
            key: key.to_string(),
            members: vec![member.to_string()],
        };
        match self.exec(cmd).await? {
            Reply::Int(n) => Ok(n > 0),
            other => Err(unexpected("ZREM", other)),
        }
    }

    async fn zcard(&self, key: &str) -> Result<i64, StoreError> {
        match self
            .exec(Command::Zcard {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Int(n) => Ok(n),
            other => Err(unexpected("ZCARD", other)),
        }
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<i64, StoreError> {
        let cmd = Command::Zcount {
            key: key.to_string(),
            min,
            max,
        };
        match self.exec(cmd).await? {
            Reply::Int(n) => Ok(n),
            other => Err(unexpected("ZCOUNT", other)),
        }
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.zrange_by_score_page(key, min, max, 0, limit).await
    }

    async fn zrange_by_score_page(
        &self,
        key: &str,
        min: i64,
        max: i64,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let cmd = Command::ZrangeByScore {
            key: key.to_string(),
            min,
            max,
            offset,
            limit,
        };
        match self.exec(cmd).await? {
            Reply::Scored(v) => Ok(v),
            other => Err(unexpected("ZRANGEBYSCORE", other)),
        }
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        match self
            .exec(Command::ZrangeWithScores {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Scored(v) => Ok(v),
            other => Err(unexpected("ZRANGE", other)),
        }
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let cmd = Command::Scan {
            cursor,
            pattern: pattern.to_string(),
            count,
        };
        match self.exec(cmd).await? {
            Reply::Scan { cursor, keys } => Ok((cursor, keys)),
            other => Err(unexpected("SCAN", other)),
        }
    }

    /// Scans until the cursor wraps and returns every matching key.
    async fn scan_all(&self, pattern: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, batch) = self.scan(cursor, pattern, count).await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

impl<T: KvClient + ?Sized> KvClientExt for T {}
