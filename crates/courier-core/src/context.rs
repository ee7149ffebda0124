use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{domain::UserId, platform::port::PlatformSession};

/// Per-account runtime context threaded through the dispatcher and handlers.
#[derive(Clone)]
pub struct AccountContext {
    pub account: Arc<str>,
    pub session: Arc<dyn PlatformSession>,
    pub self_id: UserId,
    /// Cancelled on orchestrated shutdown of this account.
    pub cancel: CancellationToken,
}

impl AccountContext {
    pub fn new(
        account: impl Into<Arc<str>>,
        session: Arc<dyn PlatformSession>,
        cancel: CancellationToken,
    ) -> Self {
        let self_id = session.identity().user_id;
        Self {
            account: account.into(),
            session,
            self_id,
            cancel,
        }
    }
}
