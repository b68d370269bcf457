use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Command, Reply};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("WRONGTYPE operation against key {0} holding the wrong kind of value")]
    WrongType(String),
    #[error("BUSYKEY target key {0} already exists")]
    BusyKey(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    None,
    String,
    Hash,
    Zset,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyType::None => "none",
            KeyType::String => "string",
            KeyType::Hash => "hash",
            KeyType::Zset => "zset",
        };
        write!(f, "{}", s)
    }
}

/// Ordered set with integer scores. Ties order by member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(String, i64)>", into = "Vec<(String, i64)>")]
pub struct ZSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl From<Vec<(String, i64)>> for ZSet {
    fn from(members: Vec<(String, i64)>) -> Self {
        let mut set = ZSet::default();
        for (member, score) in members {
            set.insert(member, score);
        }
        set
    }
}

impl From<ZSet> for Vec<(String, i64)> {
    fn from(set: ZSet) -> Self {
        set.ordered.into_iter().map(|(s, m)| (m, s)).collect()
    }
}

impl ZSet {
    /// Returns true when the member is new.
    pub fn insert(&mut self, member: String, score: i64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.ordered.remove(&(old, member.clone()));
                self.ordered.insert((score, member));
                false
            }
            None => {
                self.ordered.insert((score, member));
                true
            }
        }
    }

    pub fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &str) -> Option<i64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Members with `min <= score <= max`, ascending.
    pub fn range_by_score(&self, min: i64, max: i64) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.ordered
            .range((Bound::Included((min, String::new())), Bound::Unbounded))
            .take_while(move |(score, _)| *score <= max)
            .map(|(score, member)| (member.as_str(), *score))
    }

    pub fn first(&self) -> Option<(&str, i64)> {
        self.ordered
            .iter()
            .next()
            .map(|(score, member)| (member.as_str(), *score))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.ordered
            .iter()
            .map(|(score, member)| (member.as_str(), *score))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    String(String),
    Hash(BTreeMap<String, String>),
    Zset(ZSet),
}

impl StoredValue {
    pub fn key_type(&self) -> KeyType {
        match self {
            StoredValue::String(_) => KeyType::String,
            StoredValue::Hash(_) => KeyType::Hash,
            StoredValue::Zset(_) => KeyType::Zset,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// The full data set of one store instance.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Translate a glob (`*`, `?`) into an anchored regex. Every other character is literal.
fn glob_to_regex(pattern: &str) -> Result<Regex, ScriptError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| ScriptError::InvalidArgument(e.to_string()))
}

/// A view of the keyspace at a fixed point in time. Scripts and single commands both go
/// through this type, so expiry is applied uniformly.
pub struct ScriptContext<'a> {
    keyspace: &'a mut Keyspace,
    now_ms: i64,
}

impl<'a> ScriptContext<'a> {
    pub fn new(keyspace: &'a mut Keyspace, now_ms: i64) -> Self {
        Self { keyspace, now_ms }
    }

    /// Store time in unix ms
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .keyspace
            .entries
            .get(key)
            .is_some_and(|e| e.is_expired(self.now_ms));
        if expired {
            self.keyspace.entries.remove(key);
            return None;
        }
        self.keyspace.entries.get_mut(key)
    }

    fn expiry_from_px(&self, px: Option<i64>) -> Option<i64> {
        px.map(|ms| self.now_ms + ms.max(1))
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    pub fn key_type(&mut self, key: &str) -> KeyType {
        self.live(key)
            .map(|e| e.value.key_type())
            .unwrap_or(KeyType::None)
    }

    pub fn del(&mut self, key: &str) -> bool {
        let existed = self.exists(key);
        self.keyspace.entries.remove(key);
        existed
    }

    pub fn pttl(&mut self, key: &str) -> i64 {
        let now = self.now_ms;
        match self.live(key) {
            None => -2,
            Some(Entry {
                expires_at_ms: None,
                ..
            }) => -1,
            Some(Entry {
                expires_at_ms: Some(at),
                ..
            }) => (*at - now).max(0),
        }
    }

    pub fn pexpire(&mut self, key: &str, ms: i64) -> bool {
        let at = self.now_ms + ms.max(1);
        match self.live(key) {
            Some(entry) => {
                entry.expires_at_ms = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>, ScriptError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::String(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(ScriptError::WrongType(key.to_string())),
        }
    }

    /// Overwrites any existing value. `px` is the TTL in ms; `None` persists the key.
    pub fn set(&mut self, key: &str, value: impl Into<String>, px: Option<i64>) {
        let expires_at_ms = self.expiry_from_px(px);
        self.keyspace.entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::String(value.into()),
                expires_at_ms,
            },
        );
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut BTreeMap<String, String>, ScriptError> {
        if self.live(key).is_none() {
            self.keyspace.entries.insert(
                key.to_string(),
                Entry {
                    value: StoredValue::Hash(BTreeMap::new()),
                    expires_at_ms: None,
                },
            );
        }
        match self.keyspace.entries.get_mut(key) {
            Some(Entry {
                value: StoredValue::Hash(h),
                ..
            }) => Ok(h),
            _ => Err(ScriptError::WrongType(key.to_string())),
        }
    }

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, ScriptError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            Some(_) => Err(ScriptError::WrongType(key.to_string())),
        }
    }

    pub fn hgetall(&mut self, key: &str) -> Result<BTreeMap<String, String>, ScriptError> {
        match self.live(key) {
            None => Ok(BTreeMap::new()),
            Some(Entry {
                value: StoredValue::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(ScriptError::WrongType(key.to_string())),
        }
    }

    pub fn hset<K, V>(
        &mut self,
        key: &str,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), ScriptError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let hash = self.hash_mut(key)?;
        for (k, v) in fields {
            hash.insert(k.into(), v.into());
        }
        Ok(())
    }

    fn zset_mut(&mut self, key: &str) -> Result<&mut ZSet, ScriptError> {
        if self.live(key).is_none() {
            self.keyspace.entries.insert(
                key.to_string(),
                Entry {
                    value: StoredValue::Zset(ZSet::default()),
                    expires_at_ms: None,
                },
            );
        }
        match self.keyspace.entries.get_mut(key) {
            Some(Entry {
                value: StoredValue::Zset(z),
                ..
            }) => Ok(z),
            _ => Err(ScriptError::WrongType(key.to_string())),
        }
    }

    fn zset(&mut self, key: &str) -> Result<Option<&ZSet>, ScriptError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::Zset(z),
                ..
            }) => Ok(Some(&*z)),
            Some(_) => Err(ScriptError::WrongType(key.to_string())),
        }
    }

    /// Returns true when the member is new.
    pub fn zadd(&mut self, key: &str, member: &str, score: i64) -> Result<bool, ScriptError> {
        Ok(self.zset_mut(key)?.insert(member.to_string(), score))
    }

    /// Removes the member; the key disappears with its last member.
    pub fn zrem(&mut self, key: &str, member: &str) -> Result<bool, ScriptError> {
        let (removed, now_empty) = match self.live(key) {
            None => return Ok(false),
            Some(Entry {
                value: StoredValue::Zset(z),
                ..
            }) => {
                let removed = z.remove(member);
                (removed, z.is_empty())
            }
            Some(_) => return Err(ScriptError::WrongType(key.to_string())),
        };
        if now_empty {
            self.keyspace.entries.remove(key);
        }
        Ok(removed)
    }

    pub fn zscore(&mut self, key: &str, member: &str) -> Result<Option<i64>, ScriptError> {
        Ok(self.zset(key)?.and_then(|z| z.score(member)))
    }

    pub fn zcard(&mut self, key: &str) -> Result<usize, ScriptError> {
        Ok(self.zset(key)?.map(ZSet::len).unwrap_or(0))
    }

    pub fn zcount(&mut self, key: &str, min: i64, max: i64) -> Result<usize, ScriptError> {
        Ok(self
            .zset(key)?
            .map(|z| z.range_by_score(min, max).count())
            .unwrap_or(0))
    }

    pub fn zrange_by_score(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>, ScriptError> {
        self.zrange_by_score_page(key, min, max, 0, limit)
    }

    pub fn zrange_by_score_page(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>, ScriptError> {
        Ok(self
            .zset(key)?
            .map(|z| {
                z.range_by_score(min, max)
                    .skip(offset)
                    .take(limit.unwrap_or(usize::MAX))
                    .map(|(m, s)| (m.to_string(), s))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn zrange_with_scores(&mut self, key: &str) -> Result<Vec<(String, i64)>, ScriptError> {
        Ok(self
            .zset(key)?
            .map(|z| z.iter().map(|(m, s)| (m.to_string(), s)).collect())
            .unwrap_or_default())
    }

    /// Lowest-scored member
    pub fn zfirst(&mut self, key: &str) -> Result<Option<(String, i64)>, ScriptError> {
        Ok(self
            .zset(key)?
            .and_then(|z| z.first().map(|(m, s)| (m.to_string(), s))))
    }

    pub fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), ScriptError> {
        let re = glob_to_regex(pattern)?;
        let now = self.now_ms;
        let mut matching: Vec<&String> = self
            .keyspace
            .entries
            .iter()
            .filter(|(k, e)| !e.is_expired(now) && re.is_match(k))
            .map(|(k, _)| k)
            .collect();
        matching.sort();
        let start = usize::try_from(cursor).unwrap_or(usize::MAX);
        let count = count.max(1);
        let page: Vec<String> = matching
            .iter()
            .skip(start)
            .take(count)
            .map(|k| (*k).clone())
            .collect();
        let next = if start.saturating_add(count) < matching.len() {
            (start + count) as u64
        } else {
            0
        };
        Ok((next, page))
    }

    /// Serialized value without TTL
    pub fn dump(&mut self, key: &str) -> Result<Option<Vec<u8>>, ScriptError> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => Ok(Some(serde_json::to_vec(&entry.value)?)),
        }
    }

    /// `ttl_ms == 0` persists the key.
    pub fn restore(
        &mut self,
        key: &str,
        ttl_ms: i64,
        payload: &[u8],
        replace: bool,
    ) -> Result<(), ScriptError> {
        if !replace && self.exists(key) {
            return Err(ScriptError::BusyKey(key.to_string()));
        }
        let value: StoredValue = serde_json::from_slice(payload)?;
        let expires_at_ms = if ttl_ms > 0 {
            Some(self.now_ms + ttl_ms)
        } else {
            None
        };
        self.keyspace.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    /// Executes a single command.
    pub fn apply(&mut self, command: Command) -> Result<Reply, ScriptError> {
        let reply = match command {
            Command::Get { key } => self.get(&key)?.map(Reply::Bulk).unwrap_or(Reply::Nil),
            Command::Set { key, value, px } => {
                self.set(&key, value, px);
                Reply::Ok
            }
            Command::Del { keys } => Reply::Int(keys.iter().filter(|k| self.del(k)).count() as i64),
            Command::Exists { key } => Reply::Int(i64::from(self.exists(&key))),
            Command::Type { key } => Reply::Type(self.key_type(&key)),
            Command::Pttl { key } => Reply::Int(self.pttl(&key)),
            Command::Pexpire { key, ms } => Reply::Int(i64::from(self.pexpire(&key, ms))),
            Command::Hget { key, field } => self
                .hget(&key, &field)?
                .map(Reply::Bulk)
                .unwrap_or(Reply::Nil),
            Command::Hgetall { key } => Reply::Hash(self.hgetall(&key)?),
            Command::Hset { key, fields } => {
                let n = fields.len() as i64;
                self.hset(&key, fields)?;
                Reply::Int(n)
            }
            Command::Zadd { key, members } => {
                let mut added = 0;
                for (member, score) in members {
                    if self.zadd(&key, &member, score)? {
                        added += 1;
                    }
                }
                Reply::Int(added)
            }
            Command::Zrem { key, members } => {
                let mut removed = 0;
                for member in members {
                    if self.zrem(&key, &member)? {
                        removed += 1;
                    }
                }
                Reply::Int(removed)
            }
            Command::Zscore { key, member } => self
                .zscore(&key, &member)?
                .map(Reply::Int)
                .unwrap_or(Reply::Nil),
            Command::Zcard { key } => Reply::Int(self.zcard(&key)? as i64),
            Command::Zcount { key, min, max } => Reply::Int(self.zcount(&key, min, max)? as i64),
            Command::ZrangeByScore {
                key,
                min,
                max,
                offset,
                limit,
            } => Reply::Scored(self.zrange_by_score_page(&key, min, max, offset, limit)?),
            Command::ZrangeWithScores { key } => Reply::Scored(self.zrange_with_scores(&key)?),
            Command::Scan {
                cursor,
                pattern,
                count,
            } => {
                let (cursor, keys) = self.scan(cursor, &pattern, count)?;
                Reply::Scan { cursor, keys }
            }
            Command::Dump { key } => self.dump(&key)?.map(Reply::Bytes).unwrap_or(Reply::Nil),
            Command::Restore {
                key,
                ttl_ms,
                payload,
                replace,
            } => {
                self.restore(&key, ttl_ms, &payload, replace)?;
                Reply::Ok
            }
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_keys_are_invisible() {
        let mut ks = Keyspace::new();
        ScriptContext::new(&mut ks, 1_000).set("k", "v", Some(500));
        assert_eq!(
            ScriptContext::new(&mut ks, 1_499).get("k").unwrap(),
            Some("v".into())
        );
        assert_eq!(ScriptContext::new(&mut ks, 1_500).get("k").unwrap(), None);
        assert_eq!(ScriptContext::new(&mut ks, 1_500).pttl("k"), -2);
    }

    #[test]
    fn zset_range_and_removal() {
        let mut ks = Keyspace::new();
        let mut ctx = ScriptContext::new(&mut ks, 0);
        ctx.zadd("z", "b", 20).unwrap();
        ctx.zadd("z", "a", 10).unwrap();
        ctx.zadd("z", "c", 30).unwrap();
        assert!(!ctx.zadd("z", "c", 5).unwrap());
        assert_eq!(ctx.zfirst("z").unwrap(), Some(("c".to_string(), 5)));
        assert_eq!(ctx.zcount("z", 6, 20).unwrap(), 2);
        let page = ctx.zrange_by_score("z", 0, 100, Some(2)).unwrap();
        assert_eq!(page, vec![("c".to_string(), 5), ("a".to_string(), 10)]);
        let rest = ctx.zrange_by_score_page("z", 0, 100, 2, Some(2)).unwrap();
        assert_eq!(rest, vec![("b".to_string(), 20)]);
        for m in ["a", "b", "c"] {
            assert!(ctx.zrem("z", m).unwrap());
        }
        assert!(!ctx.exists("z"));
    }

    #[test]
    fn wrong_type_is_reported() {
        let mut ks = Keyspace::new();
        let mut ctx = ScriptContext::new(&mut ks, 0);
        ctx.set("s", "x", None);
        assert!(matches!(
            ctx.zadd("s", "m", 1),
            Err(ScriptError::WrongType(_))
        ));
        assert!(matches!(ctx.hget("s", "f"), Err(ScriptError::WrongType(_))));
    }

    #[test]
    fn scan_treats_braces_literally() {
        let mut ks = Keyspace::new();
        let mut ctx = ScriptContext::new(&mut ks, 0);
        ctx.set("{cs}:a:1:x", "1", None);
        ctx.set("{cs}:a:1:y", "1", None);
        ctx.set("{cs}:a:2:x", "1", None);
        let (cursor, first) = ctx.scan(0, "{cs}:a:1:*", 1).unwrap();
        assert_eq!(first, vec!["{cs}:a:1:x".to_string()]);
        let (cursor, second) = ctx.scan(cursor, "{cs}:a:1:*", 1).unwrap();
        assert_eq!(second, vec!["{cs}:a:1:y".to_string()]);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn dump_restore_preserves_value() {
        let mut ks = Keyspace::new();
        let mut ctx = ScriptContext::new(&mut ks, 0);
        ctx.zadd("z", "m", 42).unwrap();
        let payload = ctx.dump("z").unwrap().unwrap();
        ctx.restore("copy", 1_000, &payload, false).unwrap();
        assert_eq!(ctx.zscore("copy", "m").unwrap(), Some(42));
        assert_eq!(ctx.pttl("copy"), 1_000);
        assert!(matches!(
            ctx.restore("copy", 0, &payload, false),
            Err(ScriptError::BusyKey(_))
        ));
    }
}
