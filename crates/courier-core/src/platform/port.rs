use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{AccountIdentity, ChatId, MessageId, MessageRef},
    platform::types::{LoginToken, OutgoingMedia, PlatformEvent, Restore, SignIn},
    session::SessionCredential,
    Result,
};

/// Ordered stream of inbound events for one account.
pub type EventStream = mpsc::Receiver<PlatformEvent>;

/// Connect / authenticate side of a platform client.
///
/// One instance per account. Implementations hold no live connection until one of
/// the methods below yields a [`PlatformSession`].
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn restore(&self, credential: &SessionCredential) -> Result<Restore>;

    async fn request_code(&self, phone: &str) -> Result<LoginToken>;

    async fn submit_code(&self, phone: &str, token: &LoginToken, code: &str) -> Result<SignIn>;

    async fn submit_password(
        &self,
        token: &LoginToken,
        password: &str,
    ) -> Result<Arc<dyn PlatformSession>>;
}

/// A live, authenticated connection.
#[async_trait]
pub trait PlatformSession: Send + Sync {
    fn identity(&self) -> &AccountIdentity;

    /// Snapshot of the credential backing this session.
    fn credential(&self) -> SessionCredential;

    /// Start (or restart) delivery of inbound events.
    async fn subscribe(&self) -> Result<EventStream>;

    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef>;

    /// Send one item, or several as a single album.
    async fn send_media(&self, chat_id: ChatId, items: &[OutgoingMedia]) -> Result<Vec<MessageRef>>;

    async fn set_typing(&self, chat_id: ChatId, active: bool) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
