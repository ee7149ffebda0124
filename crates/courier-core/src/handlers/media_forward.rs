use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    config::MediaForwardConfig,
    context::AccountContext,
    dispatcher::Handler,
    domain::{ChatId, GroupId, MessageRef},
    errors::Error,
    forward_store::ForwardStore,
    platform::types::{InboundMessageEvent, MediaKind, MediaRef, OutgoingMedia},
    Result,
};

use super::media_group::{BoxFuture, CompletedGroup, MediaGroupBuffer};

/// Re-posts photos and videos from source chats into a target channel.
///
/// Albums are buffered and sent as one multi-item message; single media is
/// forwarded as soon as it arrives.
pub struct MediaForwardHandler {
    cfg: MediaForwardConfig,
    store: Arc<ForwardStore>,
    forwarder: Arc<Forwarder>,
    buffer: Arc<MediaGroupBuffer>,
}

impl MediaForwardHandler {
    pub fn new(cfg: MediaForwardConfig, store: Arc<ForwardStore>) -> Self {
        let forwarder = Arc::new(Forwarder {
            cfg: cfg.clone(),
            store: store.clone(),
        });

        let f = forwarder.clone();
        let buffer = MediaGroupBuffer::new(
            cfg.quiet_period,
            Arc::new(move |group: CompletedGroup| -> BoxFuture<Result<()>> {
                let f = f.clone();
                Box::pin(async move {
                    f.forward(&group.ctx, group.chat_id, Some(&group.group_id), &group.items)
                        .await
                })
            }),
        );

        Self {
            cfg,
            store,
            forwarder,
            buffer,
        }
    }

    fn is_source(&self, chat_id: ChatId) -> bool {
        chat_id != self.cfg.target_channel_id
            && (self.cfg.source_chat_ids.is_empty() || self.cfg.source_chat_ids.contains(&chat_id))
    }
}

fn forwardable(media: &MediaRef, include_documents: bool) -> bool {
    match media.kind {
        MediaKind::Photo | MediaKind::Video => true,
        MediaKind::Document => include_documents || media.is_video(),
    }
}

#[async_trait]
impl Handler for MediaForwardHandler {
    fn matches(&self, _ctx: &AccountContext, ev: &InboundMessageEvent) -> bool {
        self.is_source(ev.chat_id)
            && ev
                .media
                .iter()
                .any(|m| forwardable(m, self.cfg.include_documents))
    }

    async fn handle(&self, ctx: &AccountContext, ev: &InboundMessageEvent) -> Result<()> {
        if !self.store.claim(ev.message_ref()).await {
            debug!(
                account = %ctx.account,
                chat_id = %ev.chat_id,
                message_id = ev.message_id.0,
                "already forwarded; skipping"
            );
            return Ok(());
        }

        match &ev.group_id {
            None => {
                self.forwarder
                    .forward(ctx, ev.chat_id, None, std::slice::from_ref(ev))
                    .await
            }
            Some(group_id) => {
                debug!(
                    account = %ctx.account,
                    chat_id = %ev.chat_id,
                    group_id = %group_id,
                    message_id = ev.message_id.0,
                    "album member buffered"
                );
                self.buffer.add(ctx, ev.clone()).await;
                Ok(())
            }
        }
    }

    async fn on_group_end(&self, _ctx: &AccountContext, chat_id: ChatId, group_id: &GroupId) -> Result<()> {
        self.buffer.flush_now(chat_id, group_id).await
    }

    async fn shutdown(&self) {
        self.buffer.flush_all().await;
    }
}

struct Forwarder {
    cfg: MediaForwardConfig,
    store: Arc<ForwardStore>,
}

impl Forwarder {
    /// Send `items` as one message to the target, retrying once.
    ///
    /// Records are committed only after the whole send succeeded; on final
    /// failure the claims are released and nothing is recorded.
    async fn forward(
        &self,
        ctx: &AccountContext,
        chat_id: ChatId,
        group_id: Option<&GroupId>,
        items: &[InboundMessageEvent],
    ) -> Result<()> {
        let keys: Vec<MessageRef> = items.iter().map(InboundMessageEvent::message_ref).collect();
        let outgoing = self.outgoing(items);
        if outgoing.is_empty() {
            self.store.release(&keys).await;
            return Ok(());
        }

        let target = self.cfg.target_channel_id;
        if let Err(first) = ctx.session.send_media(target, &outgoing).await {
            let backoff = self.backoff_for(&first);
            warn!(
                account = %ctx.account,
                chat_id = %chat_id,
                group_id = ?group_id.map(|g| g.0.as_str()),
                error = %first,
                backoff_ms = backoff.as_millis() as u64,
                "media forward failed; retrying once"
            );

            let retry = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => false,
                _ = tokio::time::sleep(backoff) => true,
            };
            if !retry {
                self.store.release(&keys).await;
                warn!(
                    account = %ctx.account,
                    chat_id = %chat_id,
                    group_id = ?group_id.map(|g| g.0.as_str()),
                    items = outgoing.len(),
                    "media forward abandoned on shutdown"
                );
                return Ok(());
            }

            if let Err(second) = ctx.session.send_media(target, &outgoing).await {
                self.store.release(&keys).await;
                return Err(Error::Forward(format!(
                    "{} item(s) from chat {chat_id} to {target}: {second}",
                    outgoing.len()
                )));
            }
        }

        self.store.commit(&keys).await;
        info!(
            account = %ctx.account,
            chat_id = %chat_id,
            group_id = ?group_id.map(|g| g.0.as_str()),
            items = outgoing.len(),
            target = %target,
            "media forwarded"
        );
        Ok(())
    }

    /// Rate limits wait for the platform's hint, capped at `retry_backoff_max`.
    fn backoff_for(&self, err: &Error) -> Duration {
        if !err.is_rate_limited() {
            return self.cfg.retry_backoff;
        }
        err.retry_after()
            .map_or(self.cfg.retry_backoff_max, |hint| hint.min(self.cfg.retry_backoff_max))
    }

    fn outgoing(&self, items: &[InboundMessageEvent]) -> Vec<OutgoingMedia> {
        let mut out: Vec<OutgoingMedia> = items
            .iter()
            .flat_map(|ev| ev.media.iter())
            .filter(|m| forwardable(m, self.cfg.include_documents))
            .map(|m| OutgoingMedia {
                media: m.clone(),
                caption: None,
            })
            .collect();

        if self.cfg.include_captions {
            if let (Some(first), Some(head)) = (items.first(), out.first_mut()) {
                head.caption = Some(provenance_caption(items, first));
            }
        }
        out
    }
}

/// Platform limit on caption length, in characters.
const CAPTION_LIMIT: usize = 1024;
const CAPTION_SEPARATOR: &str = "\n\n—\n";

/// Original caption (first non-blank one in the album) followed by the source line.
///
/// The original caption is cut short when needed so the source line always fits.
fn provenance_caption(items: &[InboundMessageEvent], first: &InboundMessageEvent) -> String {
    let mut source = format!("From chat {}", first.chat_id);
    if let Some(sender) = first.sender_id {
        source.push_str(&format!(" (sender {})", sender.0));
    }

    let Some(caption) = items.iter().find_map(InboundMessageEvent::non_blank_text) else {
        return source;
    };
    let budget = CAPTION_LIMIT
        .saturating_sub(source.chars().count() + CAPTION_SEPARATOR.chars().count());
    if budget == 0 {
        return source;
    }

    let caption = if caption.chars().count() > budget {
        let mut cut: String = caption.chars().take(budget - 1).collect();
        cut.push('…');
        cut
    } else {
        caption.to_string()
    };
    format!("{caption}{CAPTION_SEPARATOR}{source}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::{Dispatcher, HandlerCategory, HandlerRegistration},
        domain::MessageId,
        forward_store::ForwardStatus,
        platform::{port::PlatformSession, types::PlatformEvent},
        testing::{context, photo_event, text_event, FakeSession, LogCapture},
    };
    use std::sync::atomic::Ordering;

    const TARGET: i64 = -100_500;

    fn cfg(sources: Vec<i64>) -> MediaForwardConfig {
        MediaForwardConfig {
            source_chat_ids: sources.into_iter().map(ChatId).collect(),
            target_channel_id: ChatId(TARGET),
            include_captions: true,
            include_documents: false,
            quiet_period: Duration::from_millis(1000),
            retry_backoff: Duration::from_secs(2),
            retry_backoff_max: Duration::from_secs(30),
        }
    }

    fn handler(cfg: MediaForwardConfig) -> (MediaForwardHandler, Arc<ForwardStore>) {
        let store = Arc::new(ForwardStore::new(Duration::from_secs(3600)));
        (MediaForwardHandler::new(cfg, store.clone()), store)
    }

    fn file_ids(send: &(ChatId, Vec<OutgoingMedia>)) -> Vec<String> {
        send.1.iter().map(|m| m.media.file_id.clone()).collect()
    }

    #[test]
    fn predicate_checks_media_kind_and_source() {
        let ctx = context(FakeSession::new("s"));
        let (h, _) = handler(cfg(vec![1]));
        let (open, _) = handler(cfg(vec![]));

        assert!(h.matches(&ctx, &photo_event(1, 1, None, None)));
        assert!(!h.matches(&ctx, &photo_event(2, 1, None, None)));
        assert!(open.matches(&ctx, &photo_event(2, 1, None, None)));
        assert!(!open.matches(&ctx, &photo_event(TARGET, 1, None, None)));
        assert!(!h.matches(&ctx, &text_event(1, 5, 1, "just text")));

        let mut doc = photo_event(1, 1, None, None);
        doc.media[0].kind = MediaKind::Document;
        assert!(!h.matches(&ctx, &doc));
        doc.media[0].mime_type = Some("video/mp4".to_string());
        assert!(h.matches(&ctx, &doc));

        let mut with_docs = cfg(vec![1]);
        with_docs.include_documents = true;
        let (h, _) = handler(with_docs);
        doc.media[0].mime_type = Some("application/pdf".to_string());
        assert!(h.matches(&ctx, &doc));
    }

    #[tokio::test(start_paused = true)]
    async fn album_is_sent_once_in_message_order_after_quiet_period() {
        let session = FakeSession::new("s");
        let ctx = context(session.clone());
        let (h, store) = handler(cfg(vec![1]));

        for id in [12, 10, 11] {
            let caption = (id == 10).then_some("sunset");
            h.handle(&ctx, &photo_event(1, id, Some("g"), caption)).await.unwrap();
        }
        assert!(session.sent_media().is_empty());

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let sends = session.sent_media();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, ChatId(TARGET));
        assert_eq!(file_ids(&sends[0]), vec!["photo-10", "photo-11", "photo-12"]);
        assert_eq!(
            sends[0].1[0].caption.as_deref(),
            Some("sunset\n\n—\nFrom chat 1 (sender 77)")
        );
        assert!(sends[0].1[1].caption.is_none());

        let key = MessageRef {
            chat_id: ChatId(1),
            message_id: MessageId(11),
        };
        assert!(matches!(
            store.status(&key).await,
            Some(ForwardStatus::Forwarded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn each_arrival_resets_the_quiet_period() {
        let session = FakeSession::new("s");
        let ctx = context(session.clone());
        let (h, _) = handler(cfg(vec![1]));

        h.handle(&ctx, &photo_event(1, 1, Some("g"), None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        h.handle(&ctx, &photo_event(1, 2, Some("g"), None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(session.sent_media().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let sends = session.sent_media();
        assert_eq!(sends.len(), 1);
        assert_eq!(file_ids(&sends[0]), vec!["photo-1", "photo-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn group_end_flushes_immediately_and_exactly_once() {
        let session = FakeSession::new("s");
        let ctx = context(session.clone());
        let (h, _) = handler(cfg(vec![]));

        h.handle(&ctx, &photo_event(1, 1, Some("g"), None)).await.unwrap();
        h.handle(&ctx, &photo_event(1, 2, Some("g"), None)).await.unwrap();
        h.on_group_end(&ctx, ChatId(1), &GroupId("g".to_string())).await.unwrap();
        assert_eq!(session.sent_media().len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(session.sent_media().len(), 1);
    }

    #[tokio::test]
    async fn redelivered_messages_are_not_forwarded_again() {
        let session = FakeSession::new("s");
        let ctx = context(session.clone());
        let (h, _) = handler(cfg(vec![1]));
        let ev = photo_event(1, 7, None, None);

        h.handle(&ctx, &ev).await.unwrap();
        h.handle(&ctx, &ev).await.unwrap();

        assert_eq!(session.sent_media().len(), 1);
        assert_eq!(session.media_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn captions_can_be_disabled() {
        let session = FakeSession::new("s");
        let ctx = context(session.clone());
        let mut no_captions = cfg(vec![1]);
        no_captions.include_captions = false;
        let (h, _) = handler(no_captions);

        h.handle(&ctx, &photo_event(1, 1, None, Some("hello"))).await.unwrap();

        let sends = session.sent_media();
        assert_eq!(sends[0].1[0].caption, None);
    }

    #[tokio::test(start_paused = true)]
    async fn single_failure_is_retried_after_backoff() {
        let session = FakeSession::new("s");
        session.failing_media_sends.store(1, Ordering::SeqCst);
        let ctx = context(session.clone());
        let (h, _) = handler(cfg(vec![1]));

        let started = tokio::time::Instant::now();
        h.handle(&ctx, &photo_event(1, 1, None, None)).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(session.media_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(session.sent_media().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn double_failure_discards_album_with_one_error_record() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let session = FakeSession::new("s");
        session.failing_media_sends.store(2, Ordering::SeqCst);
        let ctx = context(session.clone());
        let (h, store) = handler(cfg(vec![1]));

        for id in 1..=3 {
            h.handle(&ctx, &photo_event(1, id, Some("g"), None)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(session.media_attempts.load(Ordering::SeqCst), 2);
        assert!(session.sent_media().is_empty());
        assert_eq!(logs.count("ERROR"), 1);
        assert_eq!(logs.count("buffer discarded"), 1);
        assert_eq!(logs.count("retrying once"), 1);

        // Claims were released, so a redelivery may try again.
        let key = MessageRef {
            chat_id: ChatId(1),
            message_id: MessageId(2),
        };
        assert_eq!(store.status(&key).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_albums() {
        let session = FakeSession::new("s");
        let ctx = context(session.clone());
        let (h, _) = handler(cfg(vec![1]));

        h.handle(&ctx, &photo_event(1, 1, Some("a"), None)).await.unwrap();
        h.handle(&ctx, &photo_event(1, 2, Some("b"), None)).await.unwrap();
        h.shutdown().await;

        assert_eq!(session.sent_media().len(), 2);
        assert_eq!(h.buffer.pending_groups().await, 0);
    }

    fn dispatcher(session: &Arc<FakeSession>, h: MediaForwardHandler) -> Dispatcher {
        Dispatcher::new(
            context(session.clone()),
            vec![HandlerRegistration::new(HandlerCategory::MediaForward, Arc::new(h))],
        )
    }

    fn key(chat: i64, id: i32) -> MessageRef {
        MessageRef {
            chat_id: ChatId(chat),
            message_id: MessageId(id),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_item_double_failure_logs_one_error_through_the_dispatcher() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let session = FakeSession::new("s");
        session.failing_media_sends.store(2, Ordering::SeqCst);
        let (h, store) = handler(cfg(vec![1]));
        let d = dispatcher(&session, h);
        let events = session.subscribe().await.unwrap();

        session.push(PlatformEvent::Message(photo_event(1, 1, None, None))).await;
        session.close_stream();
        d.run(events).await;

        assert_eq!(session.media_attempts.load(Ordering::SeqCst), 2);
        assert!(session.sent_media().is_empty());
        assert_eq!(logs.count("ERROR"), 1);
        assert_eq!(logs.count("handler failed"), 1);
        assert_eq!(logs.count("retrying once"), 1);
        assert_eq!(store.status(&key(1, 1)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn group_end_double_failure_logs_one_error_through_the_dispatcher() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let session = FakeSession::new("s");
        session.failing_media_sends.store(2, Ordering::SeqCst);
        let (h, _) = handler(cfg(vec![1]));
        let d = dispatcher(&session, h);
        let events = session.subscribe().await.unwrap();

        for id in 1..=2 {
            session
                .push(PlatformEvent::Message(photo_event(1, id, Some("g"), None)))
                .await;
        }
        session
            .push(PlatformEvent::GroupEnd {
                chat_id: ChatId(1),
                group_id: GroupId("g".to_string()),
            })
            .await;
        session.close_stream();
        d.run(events).await;

        // The cancelled quiet-period timer must not flush the album a second time.
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(session.media_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(logs.count("ERROR"), 1);
        assert_eq!(logs.count("handler failed"), 1);
        assert_eq!(logs.count("buffer discarded"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_retry_backoff_abandons_the_forward() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let session = FakeSession::new("s");
        session.failing_media_sends.store(1, Ordering::SeqCst);
        let ctx = context(session.clone());
        let (h, store) = handler(cfg(vec![1]));
        let h = Arc::new(h);

        let started = tokio::time::Instant::now();
        let task = tokio::spawn({
            let (h, ctx) = (h.clone(), ctx.clone());
            async move { h.handle(&ctx, &photo_event(1, 1, None, None)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(session.media_attempts.load(Ordering::SeqCst), 1);
        assert!(session.sent_media().is_empty());
        assert_eq!(logs.count("abandoned on shutdown"), 1);
        assert_eq!(store.status(&key(1, 1)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_retry_waits_for_the_platform_hint() {
        // Hints above retry_backoff_max (30s) are capped.
        for (hint, expected) in [(5, 5), (90, 30)] {
            let session = FakeSession::new("s");
            session.failing_media_sends.store(1, Ordering::SeqCst);
            *session.rate_limit_hint.lock().unwrap() = Some(Duration::from_secs(hint));
            let ctx = context(session.clone());
            let (h, _) = handler(cfg(vec![1]));

            let started = tokio::time::Instant::now();
            h.handle(&ctx, &photo_event(1, 1, None, None)).await.unwrap();
            let waited = started.elapsed();

            assert!(
                waited >= Duration::from_secs(expected) && waited < Duration::from_secs(expected + 1),
                "hint {hint}s waited {waited:?}"
            );
            assert_eq!(session.sent_media().len(), 1);
        }
    }

    #[test]
    fn long_captions_are_cut_so_the_source_line_fits() {
        let long = "x".repeat(5000);
        let ev = photo_event(1, 1, None, Some(&long));
        let caption = provenance_caption(std::slice::from_ref(&ev), &ev);
        assert_eq!(caption.chars().count(), CAPTION_LIMIT);
        assert!(caption.ends_with("x…\n\n—\nFrom chat 1 (sender 77)"));

        let short = photo_event(1, 2, None, Some("short"));
        assert_eq!(
            provenance_caption(std::slice::from_ref(&short), &short),
            "short\n\n—\nFrom chat 1 (sender 77)"
        );
    }
}
