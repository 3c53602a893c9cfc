use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DiscordConfig;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform not configured: {0}")]
    NotConfigured(String),
    #[error("member not found: {0}")]
    MemberNotFound(String),
    #[error("platform request failed: {0}")]
    Request(String),
    #[error("platform http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("platform response decode failed: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "platform_not_configured",
            Self::MemberNotFound(_) => "member_not_found",
            Self::Request(_) => "platform_request_failed",
            Self::Http { .. } => "platform_http_error",
            Self::Decode(_) => "platform_decode_failed",
        }
    }
}

#[async_trait]
pub trait PlatformRoleApi: Send + Sync {
    async fn get_member_roles(&self, account_id: &str) -> Result<BTreeSet<String>, PlatformError>;

    /// Replaces the member's full role set.
    async fn set_member_roles(
        &self,
        account_id: &str,
        role_ids: &BTreeSet<String>,
    ) -> Result<(), PlatformError>;
}

const AUDIT_LOG_REASON: &str = "Token verification - balance reconciliation";

/// Guild member role API over Discord REST.
#[derive(Clone, Debug)]
pub struct DiscordRoleApi {
    api_base_url: String,
    guild_id: String,
    bot_token: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GuildMember {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ModifyGuildMember<'a> {
    roles: Vec<&'a str>,
}

impl DiscordRoleApi {
    pub fn from_config(config: &DiscordConfig, timeout: Duration) -> Result<Self, PlatformError> {
        let bot_token = config
            .bot_token
            .clone()
            .ok_or_else(|| PlatformError::NotConfigured("DISCORD_BOT_TOKEN is required".into()))?;
        let guild_id = config
            .guild_id
            .clone()
            .ok_or_else(|| PlatformError::NotConfigured("DISCORD_GUILD_ID is required".into()))?;
        Ok(Self {
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            guild_id,
            bot_token,
            timeout,
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn member_url(&self, account_id: &str) -> String {
        format!(
            "{}/guilds/{}/members/{}",
            self.api_base_url, self.guild_id, account_id
        )
    }

    async fn check_status(
        response: reqwest::Response,
        account_id: &str,
    ) -> Result<reqwest::Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 404 {
            return Err(PlatformError::MemberNotFound(account_id.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(PlatformError::Http {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }
}

#[async_trait]
impl PlatformRoleApi for DiscordRoleApi {
    async fn get_member_roles(&self, account_id: &str) -> Result<BTreeSet<String>, PlatformError> {
        let response = self
            .http
            .get(self.member_url(account_id))
            .header("authorization", format!("Bot {}", self.bot_token))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| PlatformError::Request(error.to_string()))?;
        let response = Self::check_status(response, account_id).await?;
        let member = response
            .json::<GuildMember>()
            .await
            .map_err(|error| PlatformError::Decode(error.to_string()))?;
        Ok(member.roles.into_iter().collect())
    }

    async fn set_member_roles(
        &self,
        account_id: &str,
        role_ids: &BTreeSet<String>,
    ) -> Result<(), PlatformError> {
        let payload = ModifyGuildMember {
            roles: role_ids.iter().map(String::as_str).collect(),
        };
        let response = self
            .http
            .patch(self.member_url(account_id))
            .header("authorization", format!("Bot {}", self.bot_token))
            .header("x-audit-log-reason", AUDIT_LOG_REASON)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|error| PlatformError::Request(error.to_string()))?;
        Self::check_status(response, account_id).await?;
        Ok(())
    }
}
