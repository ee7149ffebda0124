use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    domain::AccountIdentity,
    errors::Error,
    platform::{
        port::{PlatformClient, PlatformSession},
        types::{Restore, SignIn},
    },
    Result,
};

/// Authentication state of one account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Restoring,
    AuthRequired,
    AwaitingCode,
    Awaiting2fa,
    Connected,
    /// Terminal: explicit stop or fatal auth failure.
    Disconnected,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Uninitialized, Restoring)
            | (Restoring, Connected)
            | (Restoring, AuthRequired)
            | (Restoring, Uninitialized)
            | (AuthRequired, AwaitingCode)
            | (AwaitingCode, Awaiting2fa)
            | (AwaitingCode, Connected)
            | (Awaiting2fa, Connected) => true,
            _ => false,
        }
    }
}

/// Opaque, persistable proof of authentication for one account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    pub blob: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<AccountIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl SessionCredential {
    pub fn new(blob: impl Into<String>, identity: Option<AccountIdentity>) -> Self {
        Self {
            blob: blob.into(),
            identity,
            saved_at: None,
        }
    }

    fn parse(raw: &str) -> Result<Option<Self>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        // Plain files hold just the blob (e.g. a bot token); structured ones are JSON.
        if !raw.starts_with('{') {
            return Ok(Some(Self::new(raw, None)));
        }
        let cred: SessionCredential = serde_json::from_str(raw)
            .map_err(|e| Error::SessionInvalid(format!("corrupt stored credential: {e}")))?;
        if cred.blob.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(cred))
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("blob", &"<redacted>")
            .field("identity", &self.identity)
            .field("saved_at", &self.saved_at)
            .finish()
    }
}

/// Where an account's stored credential lives.
///
/// `env:NAME` reads it from an environment variable; anything else is a file path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    File(PathBuf),
    Env(String),
}

impl CredentialSource {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Config("session_source must not be empty".to_string()));
        }
        if let Some(var) = raw.strip_prefix("env:") {
            let var = var.trim();
            if var.is_empty() {
                return Err(Error::Config(
                    "session_source `env:` needs a variable name".to_string(),
                ));
            }
            return Ok(Self::Env(var.to_string()));
        }
        Ok(Self::File(PathBuf::from(raw)))
    }

    /// Read the stored credential; `None` when nothing has been stored yet.
    pub fn load(&self) -> Result<Option<SessionCredential>> {
        match self {
            Self::File(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                let txt = std::fs::read_to_string(path)?;
                SessionCredential::parse(&txt)
            }
            Self::Env(var) => match std::env::var(var) {
                Ok(v) => SessionCredential::parse(&v),
                Err(_) => Ok(None),
            },
        }
    }

    pub fn writable_path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Env(_) => None,
        }
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Env(var) => write!(f, "env:{var}"),
        }
    }
}

/// Supplies interactive sign-in input (login code, 2FA password).
///
/// Returning `Ok(None)` declines, which disables the account.
#[async_trait]
pub trait AuthPrompter: Send + Sync {
    async fn login_code(&self, account: &str, phone: &str) -> Result<Option<String>>;

    async fn password(&self, account: &str, hint: Option<&str>) -> Result<Option<String>>;
}

/// Prompter for unattended deployments: never answers, so expired accounts are disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeadlessPrompter;

#[async_trait]
impl AuthPrompter for HeadlessPrompter {
    async fn login_code(&self, _account: &str, _phone: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn password(&self, _account: &str, _hint: Option<&str>) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Live handle of an authenticated account.
#[derive(Clone)]
pub struct ConnectedSession {
    pub handle: Arc<dyn PlatformSession>,
    pub identity: AccountIdentity,
    pub connected_at: DateTime<Utc>,
}

impl fmt::Debug for ConnectedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedSession")
            .field("identity", &self.identity)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    session: Option<ConnectedSession>,
}

impl Inner {
    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::SessionInvalid(format!(
                "illegal session transition {:?} -> {next:?}",
                self.state
            )));
        }
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
        Ok(())
    }

    fn connect(&mut self, handle: Arc<dyn PlatformSession>) -> Result<ConnectedSession> {
        self.transition(SessionState::Connected)?;
        let session = ConnectedSession {
            identity: handle.identity().clone(),
            handle,
            connected_at: Utc::now(),
        };
        self.session = Some(session.clone());
        Ok(session)
    }
}

/// Owns one account's authentication state and live connection handle.
///
/// All transitions happen under a single lock, so concurrent `initialize` calls
/// can never produce two sessions for the same account.
pub struct SessionManager {
    account: String,
    phone: Option<String>,
    client: Arc<dyn PlatformClient>,
    prompter: Arc<dyn AuthPrompter>,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(
        account: impl Into<String>,
        phone: Option<String>,
        client: Arc<dyn PlatformClient>,
        prompter: Arc<dyn AuthPrompter>,
    ) -> Self {
        Self {
            account: account.into(),
            phone,
            client,
            prompter,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn session(&self) -> Option<ConnectedSession> {
        self.inner.lock().await.session.clone()
    }

    /// Restore the stored credential, falling back to interactive sign-in.
    ///
    /// Idempotent: while connected the existing handle is returned.
    pub async fn initialize(&self, source: &CredentialSource) -> Result<ConnectedSession> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Connected => {
                if let Some(session) = &inner.session {
                    return Ok(session.clone());
                }
            }
            SessionState::Disconnected => {
                return Err(Error::SessionInvalid(format!(
                    "account {} is disconnected",
                    self.account
                )));
            }
            SessionState::Uninitialized => {}
            interrupted => {
                warn!(account = %self.account, state = ?interrupted, "resetting interrupted sign-in");
                inner.state = SessionState::Uninitialized;
            }
        }

        inner.transition(SessionState::Restoring)?;

        let stored = match source.load() {
            Ok(c) => c,
            Err(e) => {
                inner.state = SessionState::Disconnected;
                return Err(e);
            }
        };

        match stored {
            Some(credential) => match self.client.restore(&credential).await {
                Ok(Restore::Authorized(handle)) => {
                    let session = inner.connect(handle)?;
                    info!(
                        account = %self.account,
                        user_id = session.identity.user_id.0,
                        source = %source,
                        "session restored"
                    );
                    return Ok(session);
                }
                Ok(Restore::Unauthorized) => {
                    warn!(account = %self.account, "stored credential rejected; sign-in required");
                }
                Err(e) if e.disables_account() => {
                    warn!(account = %self.account, error = %e, "stored credential invalid; sign-in required");
                }
                Err(e) => {
                    inner.transition(SessionState::Uninitialized)?;
                    return Err(e);
                }
            },
            None => {
                info!(account = %self.account, source = %source, "no stored credential; sign-in required");
            }
        }

        inner.transition(SessionState::AuthRequired)?;

        let handle = match self.sign_in_interactive(&mut inner).await {
            Ok(h) => h,
            Err(e) => {
                inner.state = SessionState::Disconnected;
                return Err(e);
            }
        };
        let session = inner.connect(handle)?;
        info!(
            account = %self.account,
            user_id = session.identity.user_id.0,
            "signed in"
        );

        if let Some(path) = source.writable_path() {
            if let Err(e) = write_credential(path, &session.handle.credential()) {
                warn!(account = %self.account, error = %e, "failed to store fresh credential");
            }
        }

        Ok(session)
    }

    async fn sign_in_interactive(&self, inner: &mut Inner) -> Result<Arc<dyn PlatformSession>> {
        let phone = self
            .phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::Auth(format!(
                    "account {} needs interactive sign-in but has no phone configured",
                    self.account
                ))
            })?;

        let token = self.client.request_code(phone).await?;
        inner.transition(SessionState::AwaitingCode)?;

        let code = self
            .prompter
            .login_code(&self.account, phone)
            .await?
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                Error::Auth(format!(
                    "no login code supplied; account {} disabled",
                    self.account
                ))
            })?;

        match self.client.submit_code(phone, &token, &code).await? {
            SignIn::Authorized(handle) => Ok(handle),
            SignIn::PasswordRequired { hint } => {
                inner.transition(SessionState::Awaiting2fa)?;
                let password = self
                    .prompter
                    .password(&self.account, hint.as_deref())
                    .await?
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        Error::Auth(format!(
                            "no 2FA password supplied; account {} disabled",
                            self.account
                        ))
                    })?;
                self.client.submit_password(&token, &password).await
            }
        }
    }

    /// Snapshot the live credential to `destination`.
    pub async fn persist(&self, destination: &Path) -> Result<()> {
        let inner = self.inner.lock().await;
        let Some(session) = inner.session.as_ref() else {
            return Err(Error::Persist(format!(
                "account {} has no live credential",
                self.account
            )));
        };
        write_credential(destination, &session.handle.credential())
            .map_err(|e| Error::Persist(format!("{}: {e}", destination.display())))?;
        info!(account = %self.account, path = %destination.display(), "credential persisted");
        Ok(())
    }

    /// Tear down the live handle. Terminal for this manager.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.session.take() {
            if let Err(e) = session.handle.disconnect().await {
                warn!(account = %self.account, error = %e, "disconnect failed");
            }
        }
        inner.state = SessionState::Disconnected;
        info!(account = %self.account, "session disconnected");
    }
}

fn write_credential(path: &Path, credential: &SessionCredential) -> Result<()> {
    let mut credential = credential.clone();
    credential.saved_at = Some(Utc::now());
    let txt = serde_json::to_string_pretty(&credential)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, txt)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
