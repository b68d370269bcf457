use async_trait::async_trait;
use futures::future::try_join_all;

use crate::store::{Command, KeyType, KvClient, KvClientExt, Reply, StoreError};

/// Copies keys between shards, replacing whatever the destination holds and carrying the
/// source TTL over. A key missing on the source is deleted on the destination.
#[async_trait]
pub trait KeyCopier: Send + Sync {
    /// Returns the number of keys written to `dst`.
    async fn copy_keys(
        &self,
        src: &dyn KvClient,
        dst: &dyn KvClient,
        keys: &[String],
        batch_size: usize,
    ) -> Result<usize, StoreError>;
}

/// TTL to carry over: `Ok(None)` for a persistent key, `Err(())` when the key is gone.
fn carried_ttl(pttl: i64) -> Result<Option<i64>, ()> {
    match pttl {
        -1 => Ok(None),
        ms if ms > 0 => Ok(Some(ms)),
        _ => Err(()),
    }
}

/// Reads each key with type-specific commands and rewrites it on the destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypeAwareCopier;

impl TypeAwareCopier {
    async fn copy_one(
        &self,
        src: &dyn KvClient,
        dst: &dyn KvClient,
        key: &str,
    ) -> Result<bool, StoreError> {
        let key_type = src.key_type(key).await?;
        let ttl = match carried_ttl(src.pttl(key).await?) {
            Ok(ttl) => ttl,
            Err(()) => {
                dst.del(vec![key.to_string()]).await?;
                return Ok(false);
            }
        };
        match key_type {
            KeyType::None => {
                dst.del(vec![key.to_string()]).await?;
                return Ok(false);
            }
            KeyType::String => {
                let Some(value) = src.get(key).await? else {
                    dst.del(vec![key.to_string()]).await?;
                    return Ok(false);
                };
                dst.exec(Command::Set {
                    key: key.to_string(),
                    value,
                    px: ttl,
                })
                .await?;
                return Ok(true);
            }
            KeyType::Hash => {
                let fields = src.hgetall(key).await?;
                dst.del(vec![key.to_string()]).await?;
                if fields.is_empty() {
                    return Ok(false);
                }
                dst.exec(Command::Hset {
                    key: key.to_string(),
                    fields: fields.into_iter().collect(),
                })
                .await?;
            }
            KeyType::Zset => {
                let members = src.zrange_with_scores(key).await?;
                dst.del(vec![key.to_string()]).await?;
                if members.is_empty() {
                    return Ok(false);
                }
                dst.exec(Command::Zadd {
                    key: key.to_string(),
                    members,
                })
                .await?;
            }
        }
        if let Some(ms) = ttl {
            dst.exec(Command::Pexpire {
                key: key.to_string(),
                ms,
            })
            .await?;
        }
        Ok(true)
    }
}

#[async_trait]
impl KeyCopier for TypeAwareCopier {
    async fn copy_keys(
        &self,
        src: &dyn KvClient,
        dst: &dyn KvClient,
        keys: &[String],
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut copied = 0;
        for batch in keys.chunks(batch_size.max(1)) {
            let written =
                try_join_all(batch.iter().map(|key| self.copy_one(src, dst, key))).await?;
            copied += written.into_iter().filter(|w| *w).count();
        }
        Ok(copied)
    }
}

/// Moves opaque serialized values with DUMP and RESTORE.
#[derive(Debug, Default, Clone, Copy)]
pub struct DumpRestoreCopier;

#[async_trait]
impl KeyCopier for DumpRestoreCopier {
    async fn copy_keys(
        &self,
        src: &dyn KvClient,
        dst: &dyn KvClient,
        keys: &[String],
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut copied = 0;
        for batch in keys.chunks(batch_size.max(1)) {
            for key in batch {
                let ttl = carried_ttl(src.pttl(key).await?);
                let payload = match src.exec(Command::Dump { key: key.clone() }).await? {
                    Reply::Bytes(payload) => Some(payload),
                    Reply::Nil => None,
                    other => {
                        return Err(StoreError::UnexpectedReply {
                            command: "DUMP",
                            reply: format!("{other:?}"),
                        })
                    }
                };
                match (payload, ttl) {
                    (Some(payload), Ok(ttl)) => {
                        dst.exec(Command::Restore {
                            key: key.clone(),
                            ttl_ms: ttl.unwrap_or(0),
                            payload,
                            replace: true,
                        })
                        .await?;
                        copied += 1;
                    }
                    _ => {
                        dst.del(vec![key.clone()]).await?;
                    }
                }
            }
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn stores() -> (Arc<ManualClock>, MemoryStore, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let src = MemoryStore::new("src", clock.clone());
        let dst = MemoryStore::new("dst", clock.clone());
        (clock, src, dst)
    }

    async fn seed(src: &MemoryStore) {
        src.exec(Command::Set {
            key: "s".into(),
            value: "v".into(),
            px: Some(30_000),
        })
        .await
        .unwrap();
        src.exec(Command::Hset {
            key: "h".into(),
            fields: vec![("f".into(), "1".into())],
        })
        .await
        .unwrap();
        src.zadd("z", "m", 42).await.unwrap();
    }

    #[tokio::test]
    async fn type_aware_copy_preserves_types_and_ttl() {
        let (_clock, src, dst) = stores();
        seed(&src).await;
        dst.zadd("gone", "x", 1).await.unwrap();
        let keys: Vec<String> = ["s", "h", "z", "gone"]
            .iter()
            .map(|k| k.to_string())
            .collect();

        let copied = TypeAwareCopier
            .copy_keys(&src, &dst, &keys, 2)
            .await
            .unwrap();
        assert_eq!(copied, 3);
        assert_eq!(dst.get("s").await.unwrap().as_deref(), Some("v"));
        assert_eq!(dst.pttl("s").await.unwrap(), 30_000);
        assert_eq!(dst.hget("h", "f").await.unwrap().as_deref(), Some("1"));
        assert_eq!(dst.pttl("h").await.unwrap(), -1);
        assert_eq!(dst.zscore("z", "m").await.unwrap(), Some(42));
        assert!(!dst.exists("gone").await.unwrap());
    }

    #[tokio::test]
    async fn dump_restore_copy_matches() {
        let (clock, src, dst) = stores();
        seed(&src).await;
        clock.advance(Duration::from_secs(10));
        let keys: Vec<String> = ["s", "h", "z"].iter().map(|k| k.to_string()).collect();

        let copied = DumpRestoreCopier
            .copy_keys(&src, &dst, &keys, 10)
            .await
            .unwrap();
        assert_eq!(copied, 3);
        assert_eq!(dst.key_type("h").await.unwrap(), KeyType::Hash);
        assert_eq!(dst.pttl("s").await.unwrap(), 20_000);
    }
}
