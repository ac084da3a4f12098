//! HTTP notification channels.
//!
//! Each sink re-checks its enable flag and credentials in the settings it is
//! handed, so a disabled or half-configured channel is skipped silently.

use std::time::Duration;

use phdoser_config::Settings;
use phdoser_core::NotificationSink;
use phdoser_traits::BoxError;
use reqwest::blocking::Client;
use serde_json::json;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const TELEGRAM_API: &str = "https://api.telegram.org";

pub fn http_client() -> reqwest::Result<Client> {
    Client::builder().timeout(SEND_TIMEOUT).build()
}

/// Telegram bot `sendMessage`.
pub struct TelegramSink {
    client: Client,
    api_base: String,
}

impl TelegramSink {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api_base: TELEGRAM_API.into(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn is_configured(settings: &Settings) -> bool {
        settings.telegram_enabled
            && !settings.telegram_bot_token.trim().is_empty()
            && !settings.telegram_chat_id.trim().is_empty()
    }
}

impl NotificationSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn send(&self, settings: &Settings, text: &str) -> Result<(), BoxError> {
        if !Self::is_configured(settings) {
            if settings.telegram_enabled {
                tracing::debug!(target: "phdoser::notify", "telegram enabled but bot token or chat id missing, skipping");
            }
            return Ok(());
        }
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            settings.telegram_bot_token.trim()
        );
        let resp = self
            .client
            .post(url)
            .json(&json!({ "chat_id": settings.telegram_chat_id.trim(), "text": text }))
            .send()?;
        tracing::debug!(target: "phdoser::notify", status = %resp.status(), "telegram POST");
        resp.error_for_status()?;
        Ok(())
    }
}

/// Discord incoming webhook.
pub struct DiscordSink {
    client: Client,
}

impl DiscordSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn is_configured(settings: &Settings) -> bool {
        settings.discord_enabled && !settings.discord_webhook_url.trim().is_empty()
    }
}

impl NotificationSink for DiscordSink {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn send(&self, settings: &Settings, text: &str) -> Result<(), BoxError> {
        if !Self::is_configured(settings) {
            if settings.discord_enabled {
                tracing::debug!(target: "phdoser::notify", "discord enabled but webhook url missing, skipping");
            }
            return Ok(());
        }
        let resp = self
            .client
            .post(settings.discord_webhook_url.trim())
            .json(&json!({ "content": text }))
            .send()?;
        tracing::debug!(target: "phdoser::notify", status = %resp.status(), "discord POST");
        resp.error_for_status()?;
        Ok(())
    }
}
