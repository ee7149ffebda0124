use std::{future::Future, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

use crate::{
    completion::CompletionClient,
    config::{AccountConfig, Config, LlmConfig, RuntimeConfig},
    context::AccountContext,
    dispatcher::{DispatchEnd, Dispatcher, HandlerCategory, HandlerRegistration},
    forward_store::ForwardStore,
    handlers::{AutoReplyHandler, MediaForwardHandler},
    platform::{
        port::{PlatformClient, PlatformSession},
        throttled::ThrottledSession,
    },
    session::{AuthPrompter, SessionManager},
    Result,
};

const INIT_ATTEMPTS: u32 = 3;
const INIT_BACKOFF: Duration = Duration::from_secs(2);
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);
/// Time left to disconnect sessions once the grace period has run out.
const ABORT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds the adapters each account needs. Implemented by the binary.
pub trait RuntimeFactory: Send + Sync {
    fn platform_client(&self, account: &AccountConfig) -> Result<Arc<dyn PlatformClient>>;

    fn completion_client(&self, llm: &LlmConfig) -> Result<Arc<dyn CompletionClient>>;

    fn prompter(&self) -> Arc<dyn AuthPrompter>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccountOutcome {
    /// Ran until shutdown.
    Stopped,
    /// Credential rejected or sign-in declined.
    Disabled(String),
    Failed(String),
    ConfigRejected(String),
    /// Still busy when the grace period ran out.
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountReport {
    pub account: String,
    pub outcome: AccountOutcome,
}

/// Runs every configured account on its own task.
///
/// Accounts fail independently; one account's failure never stops another.
pub struct Orchestrator {
    cancel: CancellationToken,
    /// Fired when the grace period runs out; accounts drop in-flight work.
    abort: CancellationToken,
    tracker: TaskTracker,
    accounts: Vec<(String, JoinHandle<AccountReport>)>,
    rejected: Vec<AccountReport>,
}

impl Orchestrator {
    pub fn start(factory: Arc<dyn RuntimeFactory>, config: Config) -> Self {
        let cancel = CancellationToken::new();
        let abort = CancellationToken::new();
        let tracker = TaskTracker::new();

        let rejected = config
            .rejected
            .into_iter()
            .map(|r| {
                error!(account = %r.name, reason = %r.reason, "account configuration rejected");
                AccountReport {
                    account: r.name,
                    outcome: AccountOutcome::ConfigRejected(r.reason),
                }
            })
            .collect();

        let runtime = Arc::new(config.runtime);
        let accounts = config
            .accounts
            .into_iter()
            .map(|acct| {
                let name = acct.name.clone();
                let handle = tracker.spawn(run_account(
                    acct,
                    runtime.clone(),
                    factory.clone(),
                    cancel.child_token(),
                    abort.clone(),
                ));
                (name, handle)
            })
            .collect::<Vec<_>>();
        tracker.close();

        info!(accounts = accounts.len(), "orchestrator started");
        Self {
            cancel,
            abort,
            tracker,
            accounts,
            rejected,
        }
    }

    /// Drive accounts until `signal` resolves or every account has ended.
    pub async fn run_until<F>(&self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = signal => info!("shutdown requested"),
            _ = self.tracker.wait() => warn!("all accounts have stopped"),
        }
    }

    /// Cancel every account and wait up to `grace` for in-flight work.
    ///
    /// Accounts still busy after that drop their work and disconnect; any that
    /// cannot do so within a short bound are aborted.
    pub async fn shutdown(self, grace: Duration) -> Vec<AccountReport> {
        self.cancel.cancel();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "grace period elapsed; abandoning in-flight work");
            self.abort.cancel();

            if tokio::time::timeout(ABORT_DISCONNECT_TIMEOUT, self.tracker.wait())
                .await
                .is_err()
            {
                warn!("accounts failed to disconnect in time; aborting");
                for (_, handle) in &self.accounts {
                    handle.abort();
                }
            }
        }

        let mut reports = self.rejected;
        for (account, handle) in self.accounts {
            let outcome = match handle.await {
                Ok(report) => {
                    reports.push(report);
                    continue;
                }
                Err(e) if e.is_cancelled() => AccountOutcome::Aborted,
                Err(e) => AccountOutcome::Failed(format!("account task panicked: {e}")),
            };
            reports.push(AccountReport { account, outcome });
        }

        for r in &reports {
            info!(account = %r.account, outcome = ?r.outcome, "account finished");
        }
        reports
    }
}

async fn run_account(
    cfg: AccountConfig,
    runtime: Arc<RuntimeConfig>,
    factory: Arc<dyn RuntimeFactory>,
    cancel: CancellationToken,
    abort: CancellationToken,
) -> AccountReport {
    let outcome = match factory.platform_client(&cfg) {
        Ok(client) => {
            let manager = SessionManager::new(
                cfg.name.as_str(),
                cfg.phone.clone(),
                client,
                factory.prompter(),
            );

            let outcome = tokio::select! {
                biased;
                r = drive_account(&cfg, &runtime, factory.as_ref(), &manager, &cancel) => classify(&cfg, r),
                _ = abort.cancelled() => {
                    warn!(account = %cfg.name, "in-flight work abandoned at shutdown");
                    AccountOutcome::Aborted
                }
            };
            // Runs on every path so an abandoned account still releases its session.
            manager.disconnect().await;
            outcome
        }
        Err(e) => classify(&cfg, Err(e)),
    };

    AccountReport {
        account: cfg.name,
        outcome,
    }
}

fn classify(cfg: &AccountConfig, result: Result<()>) -> AccountOutcome {
    match result {
        Ok(()) => AccountOutcome::Stopped,
        Err(e) if e.disables_account() => {
            error!(account = %cfg.name, error = %e, "account disabled");
            AccountOutcome::Disabled(e.to_string())
        }
        Err(e) => {
            error!(account = %cfg.name, kind = %e.kind(), error = %e, "account failed");
            AccountOutcome::Failed(e.to_string())
        }
    }
}

async fn drive_account(
    cfg: &AccountConfig,
    runtime: &RuntimeConfig,
    factory: &dyn RuntimeFactory,
    manager: &SessionManager,
    cancel: &CancellationToken,
) -> Result<()> {
    let registrations = build_registrations(cfg, runtime, factory)?;
    if registrations.is_empty() {
        warn!(account = %cfg.name, "no handlers enabled");
    }

    let mut attempt = 1;
    let connected = loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = manager.initialize(&cfg.session_source) => r,
        };
        match result {
            Ok(c) => break c,
            Err(e) if e.disables_account() || attempt >= INIT_ATTEMPTS => return Err(e),
            Err(e) => {
                let backoff = INIT_BACKOFF * attempt;
                warn!(account = %cfg.name, attempt, error = %e, "session initialization failed; retrying");
                if !sleep_or_cancel(backoff, cancel).await {
                    return Ok(());
                }
                attempt += 1;
            }
        }
    };

    let handle: Arc<dyn PlatformSession> = match runtime.throttle {
        Some(t) => Arc::new(ThrottledSession::new(connected.handle.clone(), t)),
        None => connected.handle.clone(),
    };
    let ctx = AccountContext::new(cfg.name.as_str(), handle, cancel.clone());
    let dispatcher = Dispatcher::new(ctx, registrations);

    let result = dispatch_until_cancelled(cfg, runtime, &dispatcher, cancel).await;
    dispatcher.shutdown().await;
    result
}

async fn dispatch_until_cancelled(
    cfg: &AccountConfig,
    runtime: &RuntimeConfig,
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
) -> Result<()> {
    let session = dispatcher.context().session.clone();
    let mut failures = 0;

    loop {
        let events = match session.subscribe().await {
            Ok(events) => {
                failures = 0;
                events
            }
            Err(e) => {
                failures += 1;
                if failures >= runtime.max_resubscribe_attempts {
                    return Err(e);
                }
                warn!(account = %cfg.name, failures, error = %e, "subscribe failed");
                if !sleep_or_cancel(RESUBSCRIBE_BACKOFF * failures, cancel).await {
                    return Ok(());
                }
                continue;
            }
        };

        info!(account = %cfg.name, "dispatching events");
        match dispatcher.run(events).await {
            DispatchEnd::Cancelled => return Ok(()),
            DispatchEnd::StreamClosed if cancel.is_cancelled() => return Ok(()),
            DispatchEnd::StreamClosed => {
                warn!(account = %cfg.name, "event stream closed; resubscribing");
                if !sleep_or_cancel(RESUBSCRIBE_BACKOFF, cancel).await {
                    return Ok(());
                }
            }
        }
    }
}

fn build_registrations(
    cfg: &AccountConfig,
    runtime: &RuntimeConfig,
    factory: &dyn RuntimeFactory,
) -> Result<Vec<HandlerRegistration>> {
    let mut registrations = Vec::new();

    if let Some(llm) = &cfg.llm {
        let client = factory.completion_client(llm)?;
        registrations.push(HandlerRegistration::new(
            HandlerCategory::AutoReply,
            Arc::new(AutoReplyHandler::new(llm.clone(), client)),
        ));
    }

    if let Some(mf) = &cfg.media_forward {
        // Outlives resubscriptions so redelivered messages stay deduplicated.
        let store = Arc::new(ForwardStore::new(runtime.forward_record_ttl));
        registrations.push(HandlerRegistration::new(
            HandlerCategory::MediaForward,
            Arc::new(MediaForwardHandler::new(mf.clone(), store)),
        ));
    }

    Ok(registrations)
}

/// Returns false when cancelled first.
async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
