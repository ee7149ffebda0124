use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{AccountIdentity, ChatId, MessageId, MessageRef},
    platform::{
        port::{EventStream, PlatformSession},
        types::OutgoingMedia,
    },
    session::SessionCredential,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls on one account.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls targeting the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// PlatformSession decorator that spaces out outbound calls.
///
/// Typing updates only take the global slot so they never delay the reply that
/// follows them in the same chat.
pub struct ThrottledSession {
    inner: Arc<dyn PlatformSession>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<ChatId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledSession {
    pub fn new(inner: Arc<dyn PlatformSession>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: ChatId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat_id: ChatId) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl PlatformSession for ThrottledSession {
    fn identity(&self) -> &AccountIdentity {
        self.inner.identity()
    }

    fn credential(&self) -> SessionCredential {
        self.inner.credential()
    }

    async fn subscribe(&self) -> Result<EventStream> {
        self.inner.subscribe().await
    }

    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send_text(chat_id, text, reply_to).await
    }

    async fn send_media(&self, chat_id: ChatId, items: &[OutgoingMedia]) -> Result<Vec<MessageRef>> {
        self.throttle_chat(chat_id).await;
        self.inner.send_media(chat_id, items).await
    }

    async fn set_typing(&self, chat_id: ChatId, active: bool) -> Result<()> {
        self.throttle_global().await;
        self.inner.set_typing(chat_id, active).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }
}
