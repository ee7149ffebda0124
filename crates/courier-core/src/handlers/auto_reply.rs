use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    completion::{CompletionClient, CompletionRequest},
    config::LlmConfig,
    context::AccountContext,
    dispatcher::Handler,
    errors::Error,
    platform::types::InboundMessageEvent,
    Result,
};

use super::presence::{Presence, TYPING_REFRESH};

/// Answers incoming text with a single completion, as a reply to the message.
pub struct AutoReplyHandler {
    cfg: LlmConfig,
    client: Arc<dyn CompletionClient>,
}

impl AutoReplyHandler {
    pub fn new(cfg: LlmConfig, client: Arc<dyn CompletionClient>) -> Self {
        Self { cfg, client }
    }
}

#[async_trait]
impl Handler for AutoReplyHandler {
    fn matches(&self, ctx: &AccountContext, ev: &InboundMessageEvent) -> bool {
        ev.non_blank_text().is_some()
            && (self.cfg.allowed_chat_ids.is_empty()
                || self.cfg.allowed_chat_ids.contains(&ev.chat_id))
            && ev.sender_id != Some(ctx.self_id)
    }

    async fn handle(&self, ctx: &AccountContext, ev: &InboundMessageEvent) -> Result<()> {
        let Some(text) = ev.non_blank_text() else {
            return Ok(());
        };
        let request = CompletionRequest::single_turn(&self.cfg.system_prompt, text, self.cfg.sampling);

        let presence = Presence::start(ctx.session.clone(), ev.chat_id, TYPING_REFRESH).await;
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            r = tokio::time::timeout(self.cfg.timeout, self.client.complete(&request)) => Some(r),
        };
        presence.stop().await;

        let reply = match outcome {
            None => {
                info!(
                    account = %ctx.account,
                    chat_id = %ev.chat_id,
                    message_id = ev.message_id.0,
                    "completion abandoned on shutdown"
                );
                return Ok(());
            }
            Some(Err(_)) => {
                return Err(Error::TransientApi(format!(
                    "completion timed out after {}s",
                    self.cfg.timeout.as_secs()
                )))
            }
            Some(Ok(r)) => r?,
        };

        let reply = reply.trim();
        if reply.is_empty() {
            debug!(account = %ctx.account, chat_id = %ev.chat_id, "blank completion; not replying");
            return Ok(());
        }

        ctx.session
            .send_text(ev.chat_id, reply, Some(ev.message_id))
            .await?;
        info!(
            account = %ctx.account,
            chat_id = %ev.chat_id,
            message_id = ev.message_id.0,
            "auto-reply sent"
        );
        Ok(())
    }
}
