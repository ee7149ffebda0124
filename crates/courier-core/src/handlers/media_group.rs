use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error};

use crate::{
    context::AccountContext,
    domain::{ChatId, GroupId},
    platform::types::InboundMessageEvent,
    Result,
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
pub type ProcessFn = Arc<dyn Fn(CompletedGroup) -> BoxFuture<Result<()>> + Send + Sync>;

/// An album ready to be sent, members ordered by message id.
pub struct CompletedGroup {
    pub ctx: AccountContext,
    pub chat_id: ChatId,
    pub group_id: GroupId,
    pub items: Vec<InboundMessageEvent>,
}

struct PendingGroup {
    ctx: AccountContext,
    items: Vec<InboundMessageEvent>,
    cancel: CancellationToken,
}

type GroupKey = (ChatId, GroupId);

/// Collects album members until the album is complete.
///
/// Completion is either a quiet period with no new member (the timer resets on
/// every arrival) or an explicit flush. Whichever comes first removes the group,
/// so each group is processed exactly once.
pub struct MediaGroupBuffer {
    quiet_period: Duration,
    process: ProcessFn,
    pending: Mutex<HashMap<GroupKey, PendingGroup>>,
    timers: TaskTracker,
}

impl MediaGroupBuffer {
    pub fn new(quiet_period: Duration, process: ProcessFn) -> Arc<Self> {
        Arc::new(Self {
            quiet_period,
            process,
            pending: Mutex::new(HashMap::new()),
            timers: TaskTracker::new(),
        })
    }

    /// Buffer an album member. Events without a group id are ignored.
    pub async fn add(self: &Arc<Self>, ctx: &AccountContext, ev: InboundMessageEvent) {
        let Some(group_id) = ev.group_id.clone() else {
            return;
        };
        let key = (ev.chat_id, group_id);

        let cancel = CancellationToken::new();
        {
            let mut map = self.pending.lock().await;
            match map.get_mut(&key) {
                Some(group) => {
                    group.items.push(ev);
                    group.cancel.cancel();
                    group.cancel = cancel.clone();
                }
                None => {
                    map.insert(
                        key.clone(),
                        PendingGroup {
                            ctx: ctx.clone(),
                            items: vec![ev],
                            cancel: cancel.clone(),
                        },
                    );
                }
            }
        }

        self.spawn_timer(key, cancel);
    }

    fn spawn_timer(self: &Arc<Self>, key: GroupKey, cancel: CancellationToken) {
        let buffer = Arc::clone(self);
        let quiet_period = self.quiet_period;
        self.timers.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(quiet_period) => {
                    let Some(group) = buffer.take_if_current(&key, &cancel).await else {
                        return;
                    };
                    let account = group.ctx.account.clone();
                    let (chat_id, group_id) = (group.chat_id, group.group_id.clone());
                    if let Err(e) = (buffer.process)(group).await {
                        error!(
                            account = %account,
                            chat_id = %chat_id,
                            group_id = %group_id,
                            error = %e,
                            "media group forward failed; buffer discarded"
                        );
                    }
                }
            }
        });
    }

    /// Remove the group only if `cancel` is still its live timer token.
    async fn take_if_current(
        &self,
        key: &GroupKey,
        cancel: &CancellationToken,
    ) -> Option<CompletedGroup> {
        let mut map = self.pending.lock().await;
        if cancel.is_cancelled() {
            return None;
        }
        map.remove(key).map(|g| complete(key, g))
    }

    /// Complete a group immediately (explicit end-of-group signal).
    pub async fn flush_now(&self, chat_id: ChatId, group_id: &GroupId) -> Result<()> {
        let key = (chat_id, group_id.clone());
        let group = {
            let mut map = self.pending.lock().await;
            map.remove(&key)
        };
        let Some(group) = group else {
            debug!(chat_id = %chat_id, group_id = %group_id, "group end for unknown or flushed group");
            return Ok(());
        };
        group.cancel.cancel();
        (self.process)(complete(&key, group)).await
    }

    /// Flush every pending group and wait for in-flight timer flushes.
    pub async fn flush_all(&self) {
        let groups: Vec<_> = {
            let mut map = self.pending.lock().await;
            map.drain().collect()
        };

        for (key, group) in groups {
            group.cancel.cancel();
            let account = group.ctx.account.clone();
            if let Err(e) = (self.process)(complete(&key, group)).await {
                error!(
                    account = %account,
                    chat_id = %key.0,
                    group_id = %key.1,
                    error = %e,
                    "media group forward failed; buffer discarded"
                );
            }
        }

        self.timers.close();
        self.timers.wait().await;
    }

    pub async fn pending_groups(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn complete(key: &GroupKey, group: PendingGroup) -> CompletedGroup {
    let mut items = group.items;
    items.sort_by_key(|ev| ev.message_id);
    CompletedGroup {
        ctx: group.ctx,
        chat_id: key.0,
        group_id: key.1.clone(),
        items,
    }
}
