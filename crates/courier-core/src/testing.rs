//! In-memory fakes for the platform and completion ports, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    completion::{CompletionClient, CompletionRequest},
    context::AccountContext,
    domain::{AccountIdentity, ChatId, GroupId, MessageId, MessageRef, UserId},
    errors::Error,
    platform::{
        port::{EventStream, PlatformClient, PlatformSession},
        types::{
            InboundMessageEvent, LoginToken, MediaKind, MediaRef, OutgoingMedia, PlatformEvent,
            Restore, SignIn,
        },
    },
    session::{AuthPrompter, SessionCredential},
    Result,
};

pub const SELF_ID: i64 = 4242;

#[derive(Default)]
pub struct FakeSession {
    next_id: Mutex<i32>,
    events: Mutex<Option<mpsc::Sender<PlatformEvent>>>,
    pub texts: Mutex<Vec<(ChatId, String, Option<MessageId>)>>,
    pub media_sends: Mutex<Vec<(ChatId, Vec<OutgoingMedia>)>>,
    pub media_attempts: AtomicUsize,
    pub typing: Mutex<Vec<(ChatId, bool)>>,
    pub subscribes: AtomicUsize,
    pub disconnects: AtomicUsize,
    /// Number of upcoming `send_media` calls that fail.
    pub failing_media_sends: AtomicUsize,
    /// When set, failing sends report a rate limit with this wait hint.
    pub rate_limit_hint: Mutex<Option<Duration>>,
    /// Delay before each `send_media` completes.
    pub media_send_delay: Mutex<Duration>,
    pub blob: String,
}

impl FakeSession {
    pub fn new(blob: &str) -> Arc<Self> {
        Arc::new(Self {
            next_id: Mutex::new(1000),
            blob: blob.to_string(),
            ..Default::default()
        })
    }

    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        let mut guard = self.next_id.lock().unwrap();
        let id = *guard;
        *guard += 1;
        MessageRef {
            chat_id,
            message_id: MessageId(id),
        }
    }

    pub async fn push(&self, ev: PlatformEvent) {
        let tx = self.events.lock().unwrap().clone();
        tx.expect("subscribe() must be called before pushing events")
            .send(ev)
            .await
            .unwrap();
    }

    /// Drop the sender so the current stream ends.
    pub fn close_stream(&self) {
        self.events.lock().unwrap().take();
    }

    pub async fn wait_subscribed(&self, count: usize) {
        for _ in 0..1000 {
            if self.subscribes.load(Ordering::SeqCst) >= count
                && self.events.lock().unwrap().is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session was never subscribed");
    }

    pub fn sent_texts(&self) -> Vec<(ChatId, String, Option<MessageId>)> {
        self.texts.lock().unwrap().clone()
    }

    pub fn sent_media(&self) -> Vec<(ChatId, Vec<OutgoingMedia>)> {
        self.media_sends.lock().unwrap().clone()
    }

    pub fn typing_signals(&self) -> Vec<(ChatId, bool)> {
        self.typing.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformSession for FakeSession {
    fn identity(&self) -> &AccountIdentity {
        static IDENTITY: std::sync::OnceLock<AccountIdentity> = std::sync::OnceLock::new();
        IDENTITY.get_or_init(|| AccountIdentity {
            user_id: UserId(SELF_ID),
            username: Some("courier_test".to_string()),
        })
    }

    fn credential(&self) -> SessionCredential {
        SessionCredential::new(self.blob.clone(), Some(self.identity().clone()))
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock().unwrap() = Some(tx);
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        self.texts
            .lock()
            .unwrap()
            .push((chat_id, text.to_string(), reply_to));
        Ok(self.alloc(chat_id))
    }

    async fn send_media(&self, chat_id: ChatId, items: &[OutgoingMedia]) -> Result<Vec<MessageRef>> {
        self.media_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.media_send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self.failing_media_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_media_sends.store(failing - 1, Ordering::SeqCst);
            let hint = *self.rate_limit_hint.lock().unwrap();
            return Err(match hint {
                Some(wait) => Error::rate_limited("FLOOD_WAIT", Some(wait)),
                None => Error::platform("CHAT_WRITE_FORBIDDEN"),
            });
        }
        self.media_sends
            .lock()
            .unwrap()
            .push((chat_id, items.to_vec()));
        Ok(items.iter().map(|_| self.alloc(chat_id)).collect())
    }

    async fn set_typing(&self, chat_id: ChatId, active: bool) -> Result<()> {
        self.typing.lock().unwrap().push((chat_id, active));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.close_stream();
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreBehavior {
    Authorized,
    Expired,
}

pub struct FakePlatform {
    pub session: Arc<FakeSession>,
    pub restore_behavior: RestoreBehavior,
    pub requires_password: bool,
    pub restores: AtomicUsize,
    pub code_requests: AtomicUsize,
}

impl FakePlatform {
    pub fn new(restore_behavior: RestoreBehavior) -> Arc<Self> {
        Arc::new(Self {
            session: FakeSession::new("fresh-blob"),
            restore_behavior,
            requires_password: false,
            restores: AtomicUsize::new(0),
            code_requests: AtomicUsize::new(0),
        })
    }

    pub fn with_password(restore_behavior: RestoreBehavior) -> Arc<Self> {
        Arc::new(Self {
            session: FakeSession::new("fresh-blob"),
            restore_behavior,
            requires_password: true,
            restores: AtomicUsize::new(0),
            code_requests: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn restore(&self, _credential: &SessionCredential) -> Result<Restore> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(match self.restore_behavior {
            RestoreBehavior::Authorized => Restore::Authorized(self.session.clone()),
            RestoreBehavior::Expired => Restore::Unauthorized,
        })
    }

    async fn request_code(&self, _phone: &str) -> Result<LoginToken> {
        self.code_requests.fetch_add(1, Ordering::SeqCst);
        Ok(LoginToken("login-token".to_string()))
    }

    async fn submit_code(&self, _phone: &str, _token: &LoginToken, code: &str) -> Result<SignIn> {
        if code != "12345" {
            return Err(Error::Auth("PHONE_CODE_INVALID".to_string()));
        }
        if self.requires_password {
            return Ok(SignIn::PasswordRequired {
                hint: Some("pet".to_string()),
            });
        }
        Ok(SignIn::Authorized(self.session.clone()))
    }

    async fn submit_password(
        &self,
        _token: &LoginToken,
        password: &str,
    ) -> Result<Arc<dyn PlatformSession>> {
        if password != "hunter2" {
            return Err(Error::Auth("PASSWORD_HASH_INVALID".to_string()));
        }
        Ok(self.session.clone())
    }
}

#[derive(Default)]
pub struct FakePrompter {
    pub code: Option<String>,
    pub password: Option<String>,
    pub code_prompts: AtomicUsize,
    pub password_prompts: AtomicUsize,
}

#[async_trait]
impl AuthPrompter for FakePrompter {
    async fn login_code(&self, _account: &str, _phone: &str) -> Result<Option<String>> {
        self.code_prompts.fetch_add(1, Ordering::SeqCst);
        Ok(self.code.clone())
    }

    async fn password(&self, _account: &str, _hint: Option<&str>) -> Result<Option<String>> {
        self.password_prompts.fetch_add(1, Ordering::SeqCst);
        Ok(self.password.clone())
    }
}

#[derive(Clone, Debug)]
pub enum Reply {
    Text(String),
    Fail,
    Hang,
}

pub struct FakeCompletion {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeCompletion {
    pub fn always(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: reply,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn sequence(replies: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionClient for FakeCompletion {
    async fn complete(&self, req: &CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(req.clone());
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match next {
            Reply::Text(t) => Ok(t),
            Reply::Fail => Err(Error::TransientApi("HTTP 502 Bad Gateway".to_string())),
            Reply::Hang => std::future::pending::<Result<String>>().await,
        }
    }
}

pub fn context(session: Arc<FakeSession>) -> AccountContext {
    AccountContext::new("test", session, CancellationToken::new())
}

pub fn text_event(chat: i64, sender: i64, id: i32, text: &str) -> InboundMessageEvent {
    InboundMessageEvent {
        chat_id: ChatId(chat),
        sender_id: Some(UserId(sender)),
        message_id: MessageId(id),
        text: Some(text.to_string()),
        media: Vec::new(),
        group_id: None,
        timestamp: Utc::now(),
    }
}

pub fn photo_event(chat: i64, id: i32, group: Option<&str>, caption: Option<&str>) -> InboundMessageEvent {
    InboundMessageEvent {
        chat_id: ChatId(chat),
        sender_id: Some(UserId(77)),
        message_id: MessageId(id),
        text: caption.map(str::to_string),
        media: vec![MediaRef {
            kind: MediaKind::Photo,
            file_id: format!("photo-{id}"),
            mime_type: None,
        }],
        group_id: group.map(|g| GroupId(g.to_string())),
        timestamp: Utc::now(),
    }
}

/// Captures formatted log output for assertions on failure records.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn count(&self, needle: &str) -> usize {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .filter(|l| l.contains(needle))
            .count()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
