use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, time::Instant};

use crate::domain::MessageRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardStatus {
    /// Claimed by an in-flight (possibly buffered) forward.
    Pending,
    Forwarded { at: DateTime<Utc> },
}

#[derive(Debug)]
struct ForwardRecord {
    status: ForwardStatus,
    inserted: Instant,
}

/// Deduplicates forwards by source message.
///
/// A message is forwarded at most once per account while its record is
/// retained. Records expire after `ttl` and are pruned when new claims arrive.
#[derive(Debug)]
pub struct ForwardStore {
    ttl: Duration,
    records: Mutex<HashMap<MessageRef, ForwardRecord>>,
}

impl ForwardStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Claim `key` for forwarding. Only the first caller gets `true`.
    pub async fn claim(&self, key: MessageRef) -> bool {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        records.retain(|_, r| now.duration_since(r.inserted) < self.ttl);

        if records.contains_key(&key) {
            return false;
        }
        records.insert(
            key,
            ForwardRecord {
                status: ForwardStatus::Pending,
                inserted: now,
            },
        );
        true
    }

    /// Mark claimed keys as forwarded. Called only after the whole send succeeded.
    pub async fn commit(&self, keys: &[MessageRef]) {
        let at = Utc::now();
        let mut records = self.records.lock().await;
        for key in keys {
            if let Some(r) = records.get_mut(key) {
                r.status = ForwardStatus::Forwarded { at };
            }
        }
    }

    /// Drop pending claims so a later redelivery may try again.
    pub async fn release(&self, keys: &[MessageRef]) {
        let mut records = self.records.lock().await;
        for key in keys {
            if matches!(
                records.get(key).map(|r| r.status),
                Some(ForwardStatus::Pending)
            ) {
                records.remove(key);
            }
        }
    }

    pub async fn status(&self, key: &MessageRef) -> Option<ForwardStatus> {
        self.records.lock().await.get(key).map(|r| r.status)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}
