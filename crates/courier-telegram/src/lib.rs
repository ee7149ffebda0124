//! Telegram adapter (teloxide).
//!
//! Implements the `courier-core` platform ports over the Telegram Bot API. The
//! stored credential blob is the bot token. The Bot API has no interactive
//! phone sign-in, so expired credentials disable the account.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::{
    dispatching::ShutdownToken,
    prelude::*,
    types::{ChatAction, InputFile, InputMedia, InputMediaDocument, InputMediaPhoto, InputMediaVideo},
    ApiError, RequestError,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use courier_core::{
    domain::{AccountIdentity, ChatId, GroupId, MessageId, MessageRef, UserId},
    errors::Error,
    platform::{
        port::{EventStream, PlatformClient, PlatformSession},
        types::{
            InboundMessageEvent, LoginToken, MediaKind, MediaRef, OutgoingMedia, PlatformEvent,
            Restore, SignIn,
        },
    },
    session::SessionCredential,
    Result,
};

const EVENT_BUFFER: usize = 256;

/// Connects bot accounts from a stored token.
#[derive(Clone, Debug, Default)]
pub struct TelegramClient;

impl TelegramClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PlatformClient for TelegramClient {
    async fn restore(&self, credential: &SessionCredential) -> Result<Restore> {
        let bot = Bot::new(credential.blob.trim());
        match bot.get_me().await {
            Ok(me) => {
                let identity = AccountIdentity {
                    user_id: UserId(me.id.0 as i64),
                    username: me.username.clone(),
                };
                info!(user_id = identity.user_id.0, username = ?identity.username, "bot token accepted");
                Ok(Restore::Authorized(Arc::new(TelegramSession::new(
                    bot,
                    credential.blob.trim().to_string(),
                    identity,
                ))))
            }
            Err(RequestError::Api(ApiError::NotFound)) => Ok(Restore::Unauthorized),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn request_code(&self, _phone: &str) -> Result<LoginToken> {
        Err(unsupported())
    }

    async fn submit_code(&self, _phone: &str, _token: &LoginToken, _code: &str) -> Result<SignIn> {
        Err(unsupported())
    }

    async fn submit_password(
        &self,
        _token: &LoginToken,
        _password: &str,
    ) -> Result<Arc<dyn PlatformSession>> {
        Err(unsupported())
    }
}

fn unsupported() -> Error {
    Error::Auth("interactive sign-in not supported by Bot API; store a valid bot token".to_string())
}

fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::Api(ApiError::NotFound) => Error::Auth("bot token rejected".to_string()),
        RequestError::RetryAfter(wait) => {
            Error::rate_limited(format!("telegram error: {e}"), Some(wait))
        }
        other => Error::platform(format!("telegram error: {other}")),
    }
}

fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

/// A live bot connection. Updates are long-polled by a teloxide dispatcher
/// started on `subscribe`.
pub struct TelegramSession {
    bot: Bot,
    token: String,
    identity: AccountIdentity,
    polling: Mutex<Option<ShutdownToken>>,
}

impl TelegramSession {
    pub fn new(bot: Bot, token: String, identity: AccountIdentity) -> Self {
        Self {
            bot,
            token,
            identity,
            polling: Mutex::new(None),
        }
    }

    async fn stop_polling(&self) {
        if let Some(token) = self.polling.lock().await.take() {
            // Errors when the dispatcher is idle or already stopping.
            if let Ok(done) = token.shutdown() {
                done.await;
            }
        }
    }
}

#[async_trait]
impl PlatformSession for TelegramSession {
    fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    fn credential(&self) -> SessionCredential {
        SessionCredential::new(self.token.clone(), Some(self.identity.clone()))
    }

    async fn subscribe(&self) -> Result<EventStream> {
        self.stop_polling().await;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handler = Update::filter_message().endpoint(
            |msg: Message, tx: mpsc::Sender<PlatformEvent>| async move {
                if let Some(ev) = inbound_from_message(&msg) {
                    if tx.send(PlatformEvent::Message(ev)).await.is_err() {
                        debug!("event receiver dropped");
                    }
                }
                respond(())
            },
        );

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![tx])
            .build();
        *self.polling.lock().await = Some(dispatcher.shutdown_token());

        tokio::spawn(async move {
            dispatcher.dispatch().await;
            debug!("telegram polling stopped");
        });
        Ok(rx)
    }

    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        let mut req = self.bot.send_message(tg_chat(chat_id), text.to_string());
        if let Some(id) = reply_to {
            req = req.reply_to_message_id(teloxide::types::MessageId(id.0));
        }
        let msg = req.await.map_err(map_err)?;
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_media(&self, chat_id: ChatId, items: &[OutgoingMedia]) -> Result<Vec<MessageRef>> {
        let chat = tg_chat(chat_id);
        let sent = match items {
            [] => Vec::new(),
            [single] => {
                let file = InputFile::file_id(single.media.file_id.clone());
                let caption = single.caption.clone().unwrap_or_default();
                let msg = match media_kind(&single.media) {
                    MediaKind::Photo => self.bot.send_photo(chat, file).caption(caption).await,
                    MediaKind::Video => self.bot.send_video(chat, file).caption(caption).await,
                    MediaKind::Document => self.bot.send_document(chat, file).caption(caption).await,
                }
                .map_err(map_err)?;
                vec![msg]
            }
            many => {
                let media: Vec<InputMedia> = many.iter().map(input_media).collect();
                self.bot
                    .send_media_group(chat, media)
                    .await
                    .map_err(map_err)?
            }
        };

        Ok(sent
            .iter()
            .map(|m| MessageRef {
                chat_id,
                message_id: MessageId(m.id.0),
            })
            .collect())
    }

    async fn set_typing(&self, chat_id: ChatId, active: bool) -> Result<()> {
        // Bot API typing expires on its own; there is no explicit clear.
        if !active {
            return Ok(());
        }
        self.bot
            .send_chat_action(tg_chat(chat_id), ChatAction::Typing)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_polling().await;
        Ok(())
    }
}

/// Video-typed documents are sent as videos so albums can mix them with photos.
fn media_kind(media: &MediaRef) -> MediaKind {
    match media.kind {
        MediaKind::Document if media.is_video() => MediaKind::Video,
        kind => kind,
    }
}

fn input_media(item: &OutgoingMedia) -> InputMedia {
    let file = InputFile::file_id(item.media.file_id.clone());
    let caption = item.caption.clone();
    match media_kind(&item.media) {
        MediaKind::Photo => {
            let mut m = InputMediaPhoto::new(file);
            if let Some(c) = caption {
                m = m.caption(c);
            }
            InputMedia::Photo(m)
        }
        MediaKind::Video => {
            let mut m = InputMediaVideo::new(file);
            if let Some(c) = caption {
                m = m.caption(c);
            }
            InputMedia::Video(m)
        }
        MediaKind::Document => {
            let mut m = InputMediaDocument::new(file);
            if let Some(c) = caption {
                m = m.caption(c);
            }
            InputMedia::Document(m)
        }
    }
}

/// Convert a Bot API message. Service messages (joins, pins, ...) yield `None`.
pub fn inbound_from_message(msg: &Message) -> Option<InboundMessageEvent> {
    let mut media = Vec::new();
    if let Some(sizes) = msg.photo() {
        // Largest size is last.
        if let Some(p) = sizes.last() {
            media.push(MediaRef {
                kind: MediaKind::Photo,
                file_id: p.file.id.clone(),
                mime_type: None,
            });
        }
    }
    if let Some(v) = msg.video() {
        media.push(MediaRef {
            kind: MediaKind::Video,
            file_id: v.file.id.clone(),
            mime_type: v.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(d) = msg.document() {
        media.push(MediaRef {
            kind: MediaKind::Document,
            file_id: d.file.id.clone(),
            mime_type: d.mime_type.as_ref().map(|m| m.to_string()),
        });
    }

    let text = msg.text().or_else(|| msg.caption()).map(str::to_string);
    if text.is_none() && media.is_empty() {
        return None;
    }

    Some(InboundMessageEvent {
        chat_id: ChatId(msg.chat.id.0),
        sender_id: msg.from().map(|u| UserId(u.id.0 as i64)),
        message_id: MessageId(msg.id.0),
        text,
        media,
        group_id: msg.media_group_id().map(|g| GroupId(g.to_string())),
        timestamp: msg.date,
    })
}
