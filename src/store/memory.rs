use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Command, Keyspace, KvClient, Reply, Script, ScriptContext, StoreError};
use crate::clock::Clock;

/// In-process store backend. One instance models one store shard: scripts run under the
/// keyspace lock, which serialises them exactly like a single-threaded scripting server.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    clock: Arc<dyn Clock>,
    keyspace: Mutex<Keyspace>,
    available: AtomicBool,
    evals: AtomicU64,
    commands: AtomicU64,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            keyspace: Mutex::new(Keyspace::new()),
            available: AtomicBool::new(true),
            evals: AtomicU64::new(0),
            commands: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulate an outage; every call fails with [`StoreError::Unavailable`] while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of scripts evaluated so far
    pub fn eval_count(&self) -> u64 {
        self.evals.load(Ordering::SeqCst)
    }

    /// Number of single commands executed so far
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    /// Synchronous key listing for assertions and debugging.
    pub fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let mut keyspace = self.keyspace.lock();
        let mut ctx = ScriptContext::new(&mut keyspace, self.clock.now_ms());
        ctx.scan(0, pattern, usize::MAX)
            .map(|(_, keys)| keys)
            .unwrap_or_default()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "store {} is not reachable",
                self.name
            )))
        }
    }
}

#[async_trait]
impl KvClient for MemoryStore {
    async fn eval(&self, script: &dyn Script) -> Result<Vec<u8>, StoreError> {
        self.ensure_available()?;
        self.evals.fetch_add(1, Ordering::SeqCst);
        let mut keyspace = self.keyspace.lock();
        let mut ctx = ScriptContext::new(&mut keyspace, self.clock.now_ms());
        script.run(&mut ctx).map_err(|source| StoreError::Script {
            name: script.name(),
            source,
        })
    }

    async fn exec(&self, command: Command) -> Result<Reply, StoreError> {
        self.ensure_available()?;
        self.commands.fetch_add(1, Ordering::SeqCst);
        let name = command.name();
        let mut keyspace = self.keyspace.lock();
        let mut ctx = ScriptContext::new(&mut keyspace, self.clock.now_ms());
        ctx.apply(command).map_err(|source| StoreError::Command {
            command: name,
            source,
        })
    }
}
