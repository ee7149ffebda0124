use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};

use courier_core::{
    completion::CompletionClient,
    config::{AccountConfig, Config, LlmConfig},
    orchestrator::{AccountOutcome, Orchestrator, RuntimeFactory},
    platform::port::PlatformClient,
    session::AuthPrompter,
};
use courier_openai::OpenAiCompatClient;
use courier_telegram::TelegramClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_core::logging::init("courier")?;

    let path = Config::default_path();
    let cfg = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    if cfg.accounts.is_empty() {
        anyhow::bail!("no runnable accounts in {}", path.display());
    }
    let grace = cfg.runtime.shutdown_grace;

    let orchestrator = Orchestrator::start(Arc::new(AdapterFactory::default()), cfg);
    orchestrator.run_until(shutdown_signal()).await;

    let reports = orchestrator.shutdown(grace).await;
    let failed = reports
        .iter()
        .filter(|r| matches!(r.outcome, AccountOutcome::Failed(_) | AccountOutcome::Aborted))
        .count();
    tracing::info!(accounts = reports.len(), failed, "courier stopped");

    Ok(())
}

#[derive(Default)]
struct AdapterFactory {
    prompter: Arc<StdinPrompter>,
}

impl RuntimeFactory for AdapterFactory {
    fn platform_client(&self, _account: &AccountConfig) -> courier_core::Result<Arc<dyn PlatformClient>> {
        Ok(Arc::new(TelegramClient::new()))
    }

    fn completion_client(&self, llm: &LlmConfig) -> courier_core::Result<Arc<dyn CompletionClient>> {
        Ok(Arc::new(OpenAiCompatClient::new(
            llm.api_url.clone(),
            llm.api_key.clone(),
            llm.timeout,
        )?))
    }

    fn prompter(&self) -> Arc<dyn AuthPrompter> {
        self.prompter.clone()
    }
}

/// Asks the operator on the terminal. One prompt at a time across accounts.
#[derive(Default)]
struct StdinPrompter {
    lock: Mutex<()>,
}

impl StdinPrompter {
    async fn ask(&self, question: &str) -> courier_core::Result<Option<String>> {
        let _guard = self.lock.lock().await;

        let mut err = tokio::io::stderr();
        err.write_all(question.as_bytes()).await?;
        err.flush().await?;

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        let answer = line.trim();
        if read == 0 || answer.is_empty() {
            return Ok(None);
        }
        Ok(Some(answer.to_string()))
    }
}

#[async_trait]
impl AuthPrompter for StdinPrompter {
    async fn login_code(&self, account: &str, phone: &str) -> courier_core::Result<Option<String>> {
        self.ask(&format!("[{account}] login code sent to {phone}: ")).await
    }

    async fn password(&self, account: &str, hint: Option<&str>) -> courier_core::Result<Option<String>> {
        let hint = hint.map(|h| format!(" (hint: {h})")).unwrap_or_default();
        self.ask(&format!("[{account}] 2FA password{hint}: ")).await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
