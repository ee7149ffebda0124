use std::{sync::Arc, time::Duration};

use tokio::{runtime::Handle, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{domain::ChatId, platform::port::PlatformSession};

/// Platforms expire a typing indicator after a few seconds.
pub const TYPING_REFRESH: Duration = Duration::from_secs(4);

/// Keeps a chat's typing indicator alive until stopped or dropped.
///
/// Presence signals are best-effort: failures are logged at debug and ignored.
pub struct Presence {
    session: Arc<dyn PlatformSession>,
    chat_id: ChatId,
    stop: CancellationToken,
    refresher: Option<JoinHandle<()>>,
}

impl Presence {
    pub async fn start(session: Arc<dyn PlatformSession>, chat_id: ChatId, refresh: Duration) -> Self {
        signal(session.as_ref(), chat_id, true).await;

        let stop = CancellationToken::new();
        let refresher = tokio::spawn({
            let session = session.clone();
            let stop = stop.clone();
            async move {
                let mut tick = tokio::time::interval_at(Instant::now() + refresh, refresh);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tick.tick() => signal(session.as_ref(), chat_id, true).await,
                    }
                }
            }
        });

        Self {
            session,
            chat_id,
            stop,
            refresher: Some(refresher),
        }
    }

    /// Stop refreshing and clear the indicator.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.refresher.take() {
            let _ = task.await;
        }
        signal(self.session.as_ref(), self.chat_id, false).await;
    }
}

impl Drop for Presence {
    fn drop(&mut self) {
        // Already stopped explicitly.
        let Some(task) = self.refresher.take() else {
            return;
        };
        self.stop.cancel();
        task.abort();

        if let Ok(handle) = Handle::try_current() {
            let session = self.session.clone();
            let chat_id = self.chat_id;
            handle.spawn(async move { signal(session.as_ref(), chat_id, false).await });
        }
    }
}

async fn signal(session: &dyn PlatformSession, chat_id: ChatId, active: bool) {
    if let Err(e) = session.set_typing(chat_id, active).await {
        debug!(chat_id = %chat_id, active, error = %e, "typing signal failed");
    }
}
