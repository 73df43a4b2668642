//! Ownership Verifier - asks Telegram who owns a group
//!
//! The verifier is an oracle consulted before funds are released and before
//! a listing goes live. It reports whether a user is an administrator or the
//! creator of a group; callers decide what counts as ownership.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tracing::{info, warn};

use crate::{
    error::EscrowError,
    group_monitor::{GroupAdmin, GroupInfo, GroupInspector},
    models::TelegramId,
    EscrowResult,
};

/// Retry schedule for transient oracle failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> EscrowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EscrowResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label, attempt, attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Configuration for the Telegram verifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Bot token; the bot must be a member of the group
    pub bot_token: String,
    /// Bot API base URL
    pub api_base: String,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Only the group creator counts as owner; otherwise admins do too
    pub require_creator: bool,
    /// Retry schedule for transient failures
    pub retry: RetryPolicy,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: "https://api.telegram.org".to_string(),
            request_timeout_secs: 10,
            require_creator: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Group to check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub chat_id: i64,
    pub username: Option<String>,
}

/// Oracle answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OwnershipStatus {
    pub is_admin: bool,
    pub is_creator: bool,
}

impl OwnershipStatus {
    /// Interpret a Bot API chat member status
    pub fn from_member_status(status: &str) -> Self {
        match status {
            "creator" => Self {
                is_admin: true,
                is_creator: true,
            },
            "administrator" => Self {
                is_admin: true,
                is_creator: false,
            },
            _ => Self::default(),
        }
    }

    /// Whether this answer proves ownership under the given policy
    pub fn confers_ownership(&self, require_creator: bool) -> bool {
        if require_creator {
            self.is_creator
        } else {
            self.is_admin || self.is_creator
        }
    }
}

/// Oracle interface
#[async_trait]
pub trait OwnershipVerifier: Send + Sync {
    /// Report the role of `user_id` in `group`
    async fn check(&self, group: &GroupRef, user_id: TelegramId) -> EscrowResult<OwnershipStatus>;
}

#[derive(Debug, Deserialize)]
struct BotApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
    user: Option<BotUser>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: TelegramId,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    title: Option<String>,
    description: Option<String>,
    invite_link: Option<String>,
}

/// Verifier backed by the Telegram Bot API `getChatMember` call.
/// The same client inspects groups for the listing monitor.
pub struct TelegramOwnershipVerifier {
    config: VerifierConfig,
    client: reqwest::Client,
}

impl TelegramOwnershipVerifier {
    /// Create a new verifier
    pub fn new(config: VerifierConfig) -> EscrowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EscrowError::config(format!("HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn interpret(response: BotApiResponse<ChatMember>) -> EscrowResult<OwnershipStatus> {
        // Not a member at all
        if !response.ok
            && response.error_code == Some(400)
            && response
                .description
                .as_deref()
                .map_or(false, |d| d.to_lowercase().contains("user not found"))
        {
            return Ok(OwnershipStatus::default());
        }

        let member = Self::unwrap_result("getChatMember", response)?;
        Ok(OwnershipStatus::from_member_status(&member.status))
    }

    fn unwrap_result<T>(method: &str, response: BotApiResponse<T>) -> EscrowResult<T> {
        if response.ok {
            return response
                .result
                .ok_or_else(|| EscrowError::external_api(format!("{} returned no result", method)));
        }

        let description = response.description.unwrap_or_default();
        match response.error_code {
            Some(code) if code == 429 || code >= 500 => Err(EscrowError::transient(format!(
                "Telegram error {}: {}",
                code, description
            ))),
            code => Err(EscrowError::external_api(format!(
                "Telegram error {:?}: {}",
                code, description
            ))),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> EscrowResult<BotApiResponse<T>> {
        if self.config.bot_token.trim().is_empty() {
            return Err(EscrowError::external_api("Telegram bot token not configured"));
        }

        let url = format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        );

        Ok(self.client.get(url).query(query).send().await?.json().await?)
    }
}

#[async_trait]
impl OwnershipVerifier for TelegramOwnershipVerifier {
    async fn check(&self, group: &GroupRef, user_id: TelegramId) -> EscrowResult<OwnershipStatus> {
        let response: BotApiResponse<ChatMember> = self
            .call(
                "getChatMember",
                &[
                    ("chat_id", group.chat_id.to_string()),
                    ("user_id", user_id.to_string()),
                ],
            )
            .await?;

        let status = Self::interpret(response)?;

        info!(
            "Ownership check for user {} in group {}: admin={} creator={}",
            user_id, group.chat_id, status.is_admin, status.is_creator
        );

        Ok(status)
    }
}

#[async_trait]
impl GroupInspector for TelegramOwnershipVerifier {
    async fn group_info(&self, group: &GroupRef) -> EscrowResult<GroupInfo> {
        let chat_id = [("chat_id", group.chat_id.to_string())];
        let chat: Chat = Self::unwrap_result("getChat", self.call("getChat", &chat_id).await?)?;
        let member_count: u32 = Self::unwrap_result(
            "getChatMemberCount",
            self.call("getChatMemberCount", &chat_id).await?,
        )?;

        Ok(GroupInfo {
            title: chat.title.unwrap_or_default(),
            description: chat.description,
            invite_link: chat.invite_link,
            member_count,
        })
    }

    async fn administrators(&self, group: &GroupRef) -> EscrowResult<Vec<GroupAdmin>> {
        let members: Vec<ChatMember> = Self::unwrap_result(
            "getChatAdministrators",
            self.call(
                "getChatAdministrators",
                &[("chat_id", group.chat_id.to_string())],
            )
            .await?,
        )?;

        Ok(members
            .into_iter()
            .filter_map(|member| {
                let user = member.user?;
                Some(GroupAdmin {
                    user_id: user.id,
                    username: user.username,
                    is_creator: member.status == "creator",
                })
            })
            .collect())
    }

    /// Bot tokens are `<bot id>:<secret>`
    fn bot_id(&self) -> Option<TelegramId> {
        self.config.bot_token.split(':').next()?.trim().parse().ok()
    }
}
