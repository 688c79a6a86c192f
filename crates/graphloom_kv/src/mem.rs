//! In-memory `Kv` backend.
//!
//! Single-process stand-in for Redis with the same observable
//! semantics, including key expiry. Used by tests and by the
//! single-node development mode.

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::kv::Kv;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<f64>,
}

pub struct MemoryKv {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the entry if its TTL has passed, then run `f` on what is
    /// left. All operations funnel through here so expiry is lazy but
    /// consistent.
    fn with_entries<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock().expect("kv lock poisoned");
        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            entries.remove(key);
        }
        f(&mut entries)
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_entries(key, |entries| {
            entries.get(key).and_then(|e| match &e.value {
                Value::Str(s) => Some(s.clone()),
                _ => None,
            })
        }))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_entries(key, |entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: None,
                },
            );
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_entries(key, |entries| {
            entries.remove(key);
        });
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let deadline = self.clock.now_secs() + ttl_secs as f64;
        self.with_entries(key, |entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(deadline);
            }
        });
        Ok(())
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<()> {
        self.with_entries(key, |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            if let Value::List(list) = &mut entry.value {
                list.push_back(value.to_string());
            }
        });
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_entries(key, |entries| {
            entries.get_mut(key).and_then(|e| match &mut e.value {
                Value::List(list) => list.pop_front(),
                _ => None,
            })
        }))
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        Ok(self.with_entries(key, |entries| {
            entries
                .get(key)
                .map(|e| match &e.value {
                    Value::List(list) => list.len() as u64,
                    _ => 0,
                })
                .unwrap_or(0)
        }))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.with_entries(key, |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::ZSet(HashMap::new()),
                expires_at: None,
            });
            if let Value::ZSet(set) = &mut entry.value {
                set.insert(member.to_string(), score);
            }
        });
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.with_entries(key, |entries| {
            if let Some(Entry {
                value: Value::ZSet(set),
                ..
            }) = entries.get_mut(key)
            {
                set.remove(member);
            }
        });
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.with_entries(key, |entries| {
            entries
                .get(key)
                .map(|e| match &e.value {
                    Value::ZSet(set) => set.len() as u64,
                    _ => 0,
                })
                .unwrap_or(0)
        }))
    }

    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        Ok(self.with_entries(key, |entries| {
            let mut members: Vec<(String, f64)> = entries
                .get(key)
                .map(|e| match &e.value {
                    Value::ZSet(set) => set.iter().map(|(m, s)| (m.clone(), *s)).collect(),
                    _ => Vec::new(),
                })
                .unwrap_or_default();
            members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            members
        }))
    }

    async fn zrangebyscore(&self, key: &str, max: f64) -> Result<Vec<String>> {
        let all = self.zrange_withscores(key).await?;
        Ok(all
            .into_iter()
            .filter(|(_, score)| *score <= max)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zremrangebyscore(&self, key: &str, max: f64) -> Result<()> {
        self.with_entries(key, |entries| {
            if let Some(Entry {
                value: Value::ZSet(set),
                ..
            }) = entries.get_mut(key)
            {
                set.retain(|_, score| *score > max);
            }
        });
        Ok(())
    }
}
