use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    completion::Sampling, domain::ChatId, errors::Error, platform::throttled::ThrottleConfig,
    session::CredentialSource, Result,
};

const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/api/v1/chat/completions";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant replying to Telegram messages.";
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;
/// Quiet period after the last album member before the album is considered complete.
pub const DEFAULT_GROUP_QUIET_PERIOD: Duration = Duration::from_millis(1000);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_FORWARD_RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Validated process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    /// Entries that failed validation; reported, never started.
    pub rejected: Vec<RejectedAccount>,
    pub runtime: RuntimeConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedAccount {
    pub name: String,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct AccountConfig {
    pub name: String,
    pub session_source: CredentialSource,
    pub phone: Option<String>,
    pub llm: Option<LlmConfig>,
    pub media_forward: Option<MediaForwardConfig>,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub system_prompt: String,
    /// Empty means every chat qualifies.
    pub allowed_chat_ids: Vec<ChatId>,
    pub timeout: Duration,
    pub sampling: Sampling,
}

#[derive(Clone, Debug)]
pub struct MediaForwardConfig {
    /// Empty means every chat qualifies.
    pub source_chat_ids: Vec<ChatId>,
    pub target_channel_id: ChatId,
    pub include_captions: bool,
    pub include_documents: bool,
    pub quiet_period: Duration,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub shutdown_grace: Duration,
    pub forward_record_ttl: Duration,
    /// Outbound call spacing; `None` disables throttling.
    pub throttle: Option<ThrottleConfig>,
    /// Consecutive failed resubscribe attempts before an account gives up.
    pub max_resubscribe_attempts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            forward_record_ttl: DEFAULT_FORWARD_RECORD_TTL,
            throttle: Some(ThrottleConfig::default()),
            max_resubscribe_attempts: 5,
        }
    }
}

// Raw file shapes. Every field is optional so "absent" stays distinguishable from
// "present but empty" until validation.

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    // Parsed per entry; a malformed entry rejects only that account.
    accounts: Option<Vec<serde_json::Value>>,
    runtime: Option<RawRuntime>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRuntime {
    shutdown_grace_ms: Option<u64>,
    forward_record_ttl_secs: Option<u64>,
    throttle: Option<bool>,
    max_resubscribe_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAccount {
    name: Option<String>,
    session_source: Option<String>,
    phone: Option<String>,
    llm: Option<RawLlm>,
    media_forward: Option<RawMediaForward>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLlm {
    enabled: Option<bool>,
    api_url: Option<String>,
    api_key: Option<String>,
    system_prompt: Option<String>,
    allowed_chat_ids: Option<Vec<i64>>,
    timeout: Option<u64>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMediaForward {
    enabled: Option<bool>,
    source_chat_ids: Option<Vec<i64>>,
    target_channel_id: Option<i64>,
    include_captions: Option<bool>,
    include_documents: Option<bool>,
    group_quiet_period_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
}

impl Config {
    /// Load and validate the JSON config at `path`.
    ///
    /// A `.env` next to the working directory is loaded first (without overriding
    /// the environment). A malformed file is fatal; a malformed account entry only
    /// rejects that account.
    pub fn load(path: &Path) -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let txt = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&txt)
    }

    /// Path from `COURIER_CONFIG`, else `config.json`.
    pub fn default_path() -> PathBuf {
        env_str("COURIER_CONFIG")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.json"))
    }

    pub fn from_json_str(txt: &str) -> Result<Self> {
        let raw: RawConfig =
            serde_json::from_str(txt).map_err(|e| Error::Config(format!("invalid config: {e}")))?;

        let raw_accounts = raw
            .accounts
            .ok_or_else(|| Error::Config("`accounts` is required".to_string()))?;

        let mut accounts = Vec::new();
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for (idx, value) in raw_accounts.into_iter().enumerate() {
            let label = value
                .get("name")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .and_then(non_empty)
                .unwrap_or_else(|| format!("accounts[{idx}]"));

            let parsed = serde_json::from_value::<RawAccount>(value)
                .map_err(|e| Error::Config(format!("{label}: invalid account entry: {e}")))
                .and_then(validate_account);

            match parsed {
                Ok(acct) if !seen.insert(acct.name.clone()) => rejected.push(RejectedAccount {
                    name: label,
                    reason: "duplicate account name".to_string(),
                }),
                Ok(acct) => accounts.push(acct),
                Err(e) => rejected.push(RejectedAccount {
                    name: label,
                    reason: e.to_string(),
                }),
            }
        }

        Ok(Self {
            accounts,
            rejected,
            runtime: validate_runtime(raw.runtime.unwrap_or_default()),
        })
    }
}

fn validate_runtime(raw: RawRuntime) -> RuntimeConfig {
    let defaults = RuntimeConfig::default();
    RuntimeConfig {
        shutdown_grace: raw
            .shutdown_grace_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_grace),
        forward_record_ttl: raw
            .forward_record_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.forward_record_ttl),
        throttle: match raw.throttle {
            Some(false) => None,
            _ => defaults.throttle,
        },
        max_resubscribe_attempts: raw
            .max_resubscribe_attempts
            .unwrap_or(defaults.max_resubscribe_attempts),
    }
}

fn validate_account(raw: RawAccount) -> Result<AccountConfig> {
    let name = raw
        .name
        .and_then(non_empty)
        .ok_or_else(|| Error::Config("`name` is required".to_string()))?;

    let source = raw
        .session_source
        .ok_or_else(|| Error::Config(format!("{name}: `session_source` is required")))?;
    let session_source = CredentialSource::parse(&source)
        .map_err(|e| Error::Config(format!("{name}: {e}")))?;

    let llm = match raw.llm {
        Some(l) if l.enabled.unwrap_or(false) => Some(validate_llm(&name, l)?),
        _ => None,
    };
    let media_forward = match raw.media_forward {
        Some(m) if m.enabled.unwrap_or(false) => Some(validate_media_forward(&name, m)?),
        _ => None,
    };

    Ok(AccountConfig {
        name,
        session_source,
        phone: raw.phone.and_then(non_empty),
        llm,
        media_forward,
    })
}

fn validate_llm(account: &str, raw: RawLlm) -> Result<LlmConfig> {
    let api_url = raw
        .api_url
        .and_then(non_empty)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
        return Err(Error::Config(format!(
            "{account}: llm.api_url must be an http(s) URL"
        )));
    }

    let timeout_secs = raw.timeout.unwrap_or(DEFAULT_LLM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(Error::Config(format!(
            "{account}: llm.timeout must be greater than zero"
        )));
    }

    let defaults = Sampling::default();
    Ok(LlmConfig {
        api_url,
        api_key: raw
            .api_key
            .and_then(non_empty)
            .or_else(|| env_str("COURIER_LLM_API_KEY").and_then(non_empty)),
        system_prompt: raw
            .system_prompt
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        allowed_chat_ids: raw
            .allowed_chat_ids
            .unwrap_or_default()
            .into_iter()
            .map(ChatId)
            .collect(),
        timeout: Duration::from_secs(timeout_secs),
        sampling: Sampling {
            temperature: raw.temperature.unwrap_or(defaults.temperature),
            top_p: raw.top_p.unwrap_or(defaults.top_p),
            max_tokens: raw.max_tokens.unwrap_or(defaults.max_tokens),
        },
    })
}

fn validate_media_forward(account: &str, raw: RawMediaForward) -> Result<MediaForwardConfig> {
    let target = raw.target_channel_id.ok_or_else(|| {
        Error::Config(format!(
            "{account}: media_forward.target_channel_id is required when forwarding is enabled"
        ))
    })?;
    let sources = raw.source_chat_ids.ok_or_else(|| {
        Error::Config(format!(
            "{account}: media_forward.source_chat_ids is required (use [] for all chats)"
        ))
    })?;
    if sources.contains(&target) {
        return Err(Error::Config(format!(
            "{account}: media_forward target {target} is also a source"
        )));
    }

    let retry_backoff = raw
        .retry_backoff_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_RETRY_BACKOFF);

    Ok(MediaForwardConfig {
        source_chat_ids: sources.into_iter().map(ChatId).collect(),
        target_channel_id: ChatId(target),
        include_captions: raw.include_captions.unwrap_or(true),
        include_documents: raw.include_documents.unwrap_or(false),
        quiet_period: raw
            .group_quiet_period_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GROUP_QUIET_PERIOD),
        retry_backoff,
        retry_backoff_max: DEFAULT_RETRY_BACKOFF_MAX.max(retry_backoff),
    })
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
