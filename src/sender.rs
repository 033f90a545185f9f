use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::Config;
use crate::detect::Platform;
use crate::envelope::{strip_max_prefix, MessageType};
use crate::error::{BridgeError, Result};
use crate::rpc::{BitrixClient, MaxClient, TelegramClient};
use crate::store::TenantConnector;

/// Capability set for delivering one message to a destination platform.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Destination platform this sender delivers to.
    fn platform(&self) -> Platform;

    /// Deliver one message, returning the remote message id.
    async fn deliver(
        &self,
        chat_id: &str,
        text: &str,
        message_type: MessageType,
    ) -> Result<String>;

    /// Confirm delivery of a previously delivered message. A no-op on
    /// platforms without a delivery-status call.
    async fn acknowledge_delivery(&self, chat_id: &str, remote_message_id: &str) -> Result<()>;
}

// ── CRM connector sender ────────────────────────────────────────────────────

struct BitrixSender {
    client: Arc<BitrixClient>,
    tenant: TenantConnector,
    sender_id: String,
    sender_name: String,
}

impl BitrixSender {
    fn line_id(&self) -> Result<i64> {
        self.tenant.line_id.ok_or_else(|| {
            BridgeError::resolution(format!(
                "connector {} has no activated line",
                self.tenant.connector_id
            ))
        })
    }
}

#[async_trait]
impl Sender for BitrixSender {
    fn platform(&self) -> Platform {
        Platform::Bitrix
    }

    async fn deliver(
        &self,
        chat_id: &str,
        text: &str,
        message_type: MessageType,
    ) -> Result<String> {
        let line_id = self.line_id()?;
        debug!(
            "delivering {} message to CRM line {} chat {}",
            message_type.as_str(),
            line_id,
            chat_id
        );
        self.client
            .send_message(
                &self.tenant.domain,
                self.tenant.api_token.as_deref(),
                line_id,
                chat_id,
                &self.sender_id,
                &self.sender_name,
                text,
            )
            .await
    }

    async fn acknowledge_delivery(&self, chat_id: &str, remote_message_id: &str) -> Result<()> {
        let line_id = self.line_id()?;
        self.client
            .send_status_delivery(
                &self.tenant.domain,
                self.tenant.api_token.as_deref(),
                line_id,
                chat_id,
                remote_message_id,
            )
            .await
    }
}

// ── Bot-platform senders ────────────────────────────────────────────────────

struct TelegramSender {
    client: Arc<TelegramClient>,
    bot_token: String,
}

#[async_trait]
impl Sender for TelegramSender {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn deliver(&self, chat_id: &str, text: &str, _: MessageType) -> Result<String> {
        let numeric_id: i64 = chat_id.parse().map_err(|_| {
            BridgeError::validation(format!("non-numeric telegram chat id: {chat_id}"))
        })?;
        self.client
            .send_message(&self.bot_token, numeric_id, text)
            .await
    }

    async fn acknowledge_delivery(&self, _chat_id: &str, _remote_message_id: &str) -> Result<()> {
        // The Bot API has no delivery-status call.
        Ok(())
    }
}

struct MaxSender {
    client: Arc<MaxClient>,
    bot_token: String,
}

#[async_trait]
impl Sender for MaxSender {
    fn platform(&self) -> Platform {
        Platform::Max
    }

    async fn deliver(&self, chat_id: &str, text: &str, _: MessageType) -> Result<String> {
        // Accepts both namespaced and native ids.
        let native_id = strip_max_prefix(chat_id).unwrap_or(chat_id);
        self.client
            .send_message(&self.bot_token, native_id, text)
            .await
    }

    async fn acknowledge_delivery(&self, _chat_id: &str, _remote_message_id: &str) -> Result<()> {
        Ok(())
    }
}

// ── Factory ─────────────────────────────────────────────────────────────────

/// Destination platform for a namespaced chat identifier: the Max prefix
/// routes to Max, everything else is a numeric Telegram id.
pub fn route_for_chat_id(chat_id: &str) -> Platform {
    if strip_max_prefix(chat_id).is_some() {
        Platform::Max
    } else {
        Platform::Telegram
    }
}

/// Produces a polymorphic sender for a platform tag or a chat identifier.
/// Stateless: all credentials come from the tenant row with a config
/// fallback for the bot tokens.
pub struct MessengerFactory {
    bitrix: Arc<BitrixClient>,
    telegram: Arc<TelegramClient>,
    max: Arc<MaxClient>,
    telegram_fallback_token: Option<String>,
    max_fallback_token: Option<String>,
}

impl MessengerFactory {
    /// Direct access to the CRM client for non-message RPC (connector
    /// activation and deactivation).
    pub fn bitrix_client(&self) -> &BitrixClient {
        &self.bitrix
    }

    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let timeout = config.bitrix.request_timeout_secs;
        Ok(Self {
            bitrix: Arc::new(BitrixClient::new(&config.bitrix)?),
            telegram: Arc::new(TelegramClient::new(&config.telegram, timeout)?),
            max: Arc::new(MaxClient::new(&config.max, timeout)?),
            telegram_fallback_token: config.telegram.bot_token.clone(),
            max_fallback_token: config.max.bot_token.clone(),
        })
    }

    /// Forward routing: a sender that delivers TO the given platform,
    /// bound to the tenant's credentials.
    pub fn for_platform(
        &self,
        platform: Platform,
        tenant: &TenantConnector,
        sender_id: &str,
        sender_name: &str,
    ) -> Result<Arc<dyn Sender>> {
        match platform {
            Platform::Bitrix => Ok(Arc::new(BitrixSender {
                client: Arc::clone(&self.bitrix),
                tenant: tenant.clone(),
                sender_id: sender_id.to_string(),
                sender_name: sender_name.to_string(),
            })),
            Platform::Telegram => {
                let token = tenant
                    .telegram_token
                    .clone()
                    .or_else(|| self.telegram_fallback_token.clone())
                    .ok_or_else(|| {
                        BridgeError::resolution(format!(
                            "no telegram bot token for {}",
                            tenant.domain
                        ))
                    })?;
                Ok(Arc::new(TelegramSender {
                    client: Arc::clone(&self.telegram),
                    bot_token: token,
                }))
            }
            Platform::Max => {
                let token = tenant
                    .max_token
                    .clone()
                    .or_else(|| self.max_fallback_token.clone())
                    .ok_or_else(|| {
                        BridgeError::resolution(format!("no max bot token for {}", tenant.domain))
                    })?;
                Ok(Arc::new(MaxSender {
                    client: Arc::clone(&self.max),
                    bot_token: token,
                }))
            }
            Platform::SessionRelay | Platform::Unknown => {
                Err(BridgeError::UnsupportedPlatform(platform))
            }
        }
    }

    /// Reverse routing for CRM-originated operator replies: dispatch purely
    /// on the chat identifier's namespace prefix.
    pub fn for_chat_id(&self, chat_id: &str, tenant: &TenantConnector) -> Result<Arc<dyn Sender>> {
        self.for_platform(route_for_chat_id(chat_id), tenant, "", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [bitrix]

            [telegram]
            bot_token = "tg-fallback"

            [max]
            bot_token = "max-fallback"
            "#,
        )
        .unwrap()
    }

    fn tenant() -> TenantConnector {
        TenantConnector {
            domain: "acme.test".to_string(),
            connector_id: "connector_0".to_string(),
            api_token: None,
            line_id: Some(1),
            telegram_token: None,
            max_token: None,
            active: true,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_route_for_chat_id_prefix_dispatch() {
        assert_eq!(route_for_chat_id("max_77"), Platform::Max);
        assert_eq!(route_for_chat_id("42"), Platform::Telegram);
        assert_eq!(route_for_chat_id("max_"), Platform::Max);
    }

    #[test]
    fn test_for_chat_id_picks_variant() {
        let factory = MessengerFactory::new(&test_config()).unwrap();
        let tenant = tenant();

        let sender = factory.for_chat_id("max_77", &tenant).unwrap();
        assert_eq!(sender.platform(), Platform::Max);

        let sender = factory.for_chat_id("42", &tenant).unwrap();
        assert_eq!(sender.platform(), Platform::Telegram);
    }

    #[test]
    fn test_for_platform_rejects_unroutable_tags() {
        let factory = MessengerFactory::new(&test_config()).unwrap();
        let tenant = tenant();

        assert!(matches!(
            factory.for_platform(Platform::Unknown, &tenant, "", ""),
            Err(BridgeError::UnsupportedPlatform(_))
        ));
        assert!(matches!(
            factory.for_platform(Platform::SessionRelay, &tenant, "", ""),
            Err(BridgeError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_missing_bot_token_is_resolution_error() {
        let config: Config = toml::from_str("[bitrix]\n").unwrap();
        let factory = MessengerFactory::new(&config).unwrap();
        let tenant = tenant();

        assert!(matches!(
            factory.for_platform(Platform::Telegram, &tenant, "", ""),
            Err(BridgeError::Resolution(_))
        ));
    }

    #[test]
    fn test_tenant_token_overrides_fallback() {
        let factory = MessengerFactory::new(&test_config()).unwrap();
        let mut tenant = tenant();
        tenant.telegram_token = Some("tg-tenant".to_string());

        // Construction succeeds with either source; the tenant token wins
        // inside for_platform, which is all this seam guarantees.
        let sender = factory
            .for_platform(Platform::Telegram, &tenant, "", "")
            .unwrap();
        assert_eq!(sender.platform(), Platform::Telegram);
    }
}
