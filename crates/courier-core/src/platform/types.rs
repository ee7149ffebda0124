use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{ChatId, GroupId, MessageId, MessageRef, UserId};

use super::port::PlatformSession;

/// Kind of media attached to an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    Document,
}

/// Platform-side reference to a media object; sending it again never re-uploads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
    pub mime_type: Option<String>,
}

impl MediaRef {
    /// Documents carrying a `video/*` mime type are treated as videos.
    pub fn is_video(&self) -> bool {
        match self.kind {
            MediaKind::Video => true,
            MediaKind::Document => self
                .mime_type
                .as_deref()
                .is_some_and(|m| m.starts_with("video/")),
            MediaKind::Photo => false,
        }
    }
}

/// A single inbound message, consumed within one dispatch cycle.
#[derive(Clone, Debug)]
pub struct InboundMessageEvent {
    pub chat_id: ChatId,
    pub sender_id: Option<UserId>,
    pub message_id: MessageId,
    /// Message text, or the caption for media messages.
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
    /// Present for album members.
    pub group_id: Option<GroupId>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessageEvent {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            chat_id: self.chat_id,
            message_id: self.message_id,
        }
    }

    /// Text with surrounding whitespace removed, `None` when blank.
    pub fn non_blank_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Everything an account's event stream can yield.
#[derive(Clone, Debug)]
pub enum PlatformEvent {
    Message(InboundMessageEvent),
    /// The platform signalled that no further members of this album will arrive.
    GroupEnd { chat_id: ChatId, group_id: GroupId },
    /// The stream is gone; the dispatcher stops and the runner may resubscribe.
    Disconnected { reason: String },
}

/// One item of an outbound (possibly multi-item) media send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMedia {
    pub media: MediaRef,
    pub caption: Option<String>,
}

/// Opaque handle returned by `request_code`, passed back when signing in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginToken(pub String);

/// Result of restoring a stored credential.
pub enum Restore {
    Authorized(Arc<dyn PlatformSession>),
    /// Credential expired / revoked; interactive sign-in is required.
    Unauthorized,
}

/// Result of submitting a login code.
pub enum SignIn {
    Authorized(Arc<dyn PlatformSession>),
    PasswordRequired { hint: Option<String> },
}
