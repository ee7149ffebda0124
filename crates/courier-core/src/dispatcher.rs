use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, warn};

use crate::{
    context::AccountContext,
    domain::{ChatId, GroupId, MessageId},
    errors::{Error, ErrorKind},
    platform::{
        port::EventStream,
        types::{InboundMessageEvent, PlatformEvent},
    },
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerCategory {
    AutoReply,
    MediaForward,
}

impl HandlerCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerCategory::AutoReply => "auto_reply",
            HandlerCategory::MediaForward => "media_forward",
        }
    }
}

/// A unit of event-driven behavior bound to one account.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Cheap, side-effect free predicate evaluated on the dispatch loop.
    fn matches(&self, ctx: &AccountContext, ev: &InboundMessageEvent) -> bool;

    async fn handle(&self, ctx: &AccountContext, ev: &InboundMessageEvent) -> Result<()>;

    /// Explicit end-of-album signal from the platform.
    async fn on_group_end(
        &self,
        _ctx: &AccountContext,
        _chat_id: ChatId,
        _group_id: &GroupId,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once when the account stops; flush buffered work here.
    async fn shutdown(&self) {}
}

#[derive(Clone)]
pub struct HandlerRegistration {
    pub category: HandlerCategory,
    pub handler: Arc<dyn Handler>,
}

impl HandlerRegistration {
    pub fn new(category: HandlerCategory, handler: Arc<dyn Handler>) -> Self {
        Self { category, handler }
    }
}

/// Why a dispatch run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchEnd {
    Cancelled,
    StreamClosed,
}

enum Job {
    Message(InboundMessageEvent),
    GroupEnd(GroupId),
}

struct LaneJob {
    handler: Arc<dyn Handler>,
    job: Job,
}

type LaneKey = (ChatId, HandlerCategory);

/// Routes one account's events to its handlers.
///
/// Invocations are queued on a lane per `(chat, category)`; each lane is drained
/// by its own task, so events in one lane are handled strictly in arrival order
/// while other chats and categories proceed concurrently.
pub struct Dispatcher {
    ctx: AccountContext,
    registrations: Vec<HandlerRegistration>,
}

impl Dispatcher {
    pub fn new(ctx: AccountContext, registrations: Vec<HandlerRegistration>) -> Self {
        Self { ctx, registrations }
    }

    pub fn context(&self) -> &AccountContext {
        &self.ctx
    }

    /// Consume `events` until the stream ends or the account is cancelled, then
    /// wait for every lane to drain.
    ///
    /// Lanes live for the duration of one run; they are not evicted while idle.
    pub async fn run(&self, mut events: EventStream) -> DispatchEnd {
        let mut lanes: HashMap<LaneKey, mpsc::UnboundedSender<LaneJob>> = HashMap::new();
        let mut workers = JoinSet::new();

        let end = loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => break DispatchEnd::Cancelled,
                ev = events.recv() => match ev {
                    None => break DispatchEnd::StreamClosed,
                    Some(PlatformEvent::Disconnected { reason }) => {
                        warn!(account = %self.ctx.account, %reason, "platform disconnected");
                        break DispatchEnd::StreamClosed;
                    }
                    Some(PlatformEvent::Message(ev)) => {
                        for reg in &self.registrations {
                            if !reg.handler.matches(&self.ctx, &ev) {
                                continue;
                            }
                            debug!(
                                account = %self.ctx.account,
                                handler = reg.category.as_str(),
                                chat_id = %ev.chat_id,
                                message_id = ev.message_id.0,
                                "event routed"
                            );
                            let job = LaneJob { handler: reg.handler.clone(), job: Job::Message(ev.clone()) };
                            self.enqueue(&mut lanes, &mut workers, (ev.chat_id, reg.category), job);
                        }
                    }
                    Some(PlatformEvent::GroupEnd { chat_id, group_id }) => {
                        for reg in &self.registrations {
                            let job = LaneJob { handler: reg.handler.clone(), job: Job::GroupEnd(group_id.clone()) };
                            self.enqueue(&mut lanes, &mut workers, (chat_id, reg.category), job);
                        }
                    }
                },
            }
        };

        drop(lanes);
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(account = %self.ctx.account, error = %e, "lane worker failed");
            }
        }
        end
    }

    /// Let every handler flush buffered work. Call once, after the last `run`.
    pub async fn shutdown(&self) {
        for reg in &self.registrations {
            reg.handler.shutdown().await;
        }
    }

    fn enqueue(
        &self,
        lanes: &mut HashMap<LaneKey, mpsc::UnboundedSender<LaneJob>>,
        workers: &mut JoinSet<()>,
        key: LaneKey,
        job: LaneJob,
    ) {
        let tx = lanes.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.spawn(run_lane(self.ctx.clone(), key, rx));
            tx
        });
        if tx.send(job).is_err() {
            error!(account = %self.ctx.account, chat_id = %key.0, "lane closed; event dropped");
        }
    }
}

async fn run_lane(
    ctx: AccountContext,
    (chat_id, category): LaneKey,
    mut rx: mpsc::UnboundedReceiver<LaneJob>,
) {
    while let Some(LaneJob { handler, job }) = rx.recv().await {
        if ctx.cancel.is_cancelled() {
            debug!(account = %ctx.account, handler = category.as_str(), chat_id = %chat_id, "skipping queued event on shutdown");
            continue;
        }

        let message_id = match &job {
            Job::Message(ev) => Some(ev.message_id),
            Job::GroupEnd(_) => None,
        };

        // Run each invocation in its own task so a panic stays inside it. The
        // handle aborts the task when the lane itself is dropped.
        let task_ctx = ctx.clone();
        let joined = AbortOnDropHandle::new(tokio::spawn(async move {
            match job {
                Job::Message(ev) => handler.handle(&task_ctx, &ev).await,
                Job::GroupEnd(group_id) => handler.on_group_end(&task_ctx, chat_id, &group_id).await,
            }
        }))
        .await;

        let outcome = match joined {
            Ok(r) => r,
            Err(e) if e.is_panic() => Err(Error::Dispatch(format!(
                "{} handler panicked",
                category.as_str()
            ))),
            Err(e) => Err(Error::Dispatch(e.to_string())),
        };

        if let Err(e) = outcome {
            report_failure(&ctx, category, chat_id, message_id, &e);
        }
    }
}

fn report_failure(
    ctx: &AccountContext,
    category: HandlerCategory,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    err: &Error,
) {
    let message_id = message_id.map(|m| m.0);
    match err.kind() {
        ErrorKind::TransientApi => warn!(
            account = %ctx.account,
            handler = category.as_str(),
            chat_id = %chat_id,
            message_id = ?message_id,
            error = %err,
            "handler failed"
        ),
        kind => error!(
            account = %ctx.account,
            handler = category.as_str(),
            chat_id = %chat_id,
            message_id = ?message_id,
            kind = %kind,
            error = %err,
            "handler failed"
        ),
    }
}
