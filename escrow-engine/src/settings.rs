//! Runtime settings
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `TRUSTLINK__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::{
    group_monitor::MonitorConfig,
    node::EscrowNodeConfig,
    ownership::VerifierConfig,
    payment_gateway::GatewayConfig,
    settlement::SettlementConfig,
    sweeper::SweeperConfig,
    transaction_manager::TransactionManagerConfig,
    user_registry::UserRegistryConfig,
    EscrowResult,
};

const ENV_PREFIX: &str = "TRUSTLINK";
const ENV_SEPARATOR: &str = "__";
const REDACTED: &str = "********";

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Required in `X-Admin-Token` for arbitration endpoints; unset disables them
    pub admin_token: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            admin_token: None,
        }
    }
}

/// All settings for a running node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub escrow: TransactionManagerConfig,
    pub settlement: SettlementConfig,
    pub verifier: VerifierConfig,
    pub coinbase: GatewayConfig,
    pub users: UserRegistryConfig,
    pub sweeper: SweeperConfig,
    pub monitor: MonitorConfig,
}

impl Settings {
    /// Load settings from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> EscrowResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.warn_on_gaps();
        Ok(settings)
    }

    /// Engine configuration carried by these settings
    pub fn node_config(&self) -> EscrowNodeConfig {
        EscrowNodeConfig {
            escrow: self.escrow.clone(),
            settlement: self.settlement.clone(),
            verifier: self.verifier.clone(),
            gateway: self.coinbase.clone(),
            users: self.users.clone(),
            sweeper: self.sweeper.clone(),
            monitor: self.monitor.clone(),
        }
    }

    /// Copy with secrets masked, for printing
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |value: &mut String| {
            if !value.is_empty() {
                *value = REDACTED.to_string();
            }
        };

        mask(&mut copy.verifier.bot_token);
        mask(&mut copy.coinbase.webhook_secret);
        if let Some(key) = copy.coinbase.api_key.as_mut() {
            mask(key);
        }
        if let Some(token) = copy.server.admin_token.as_mut() {
            mask(token);
        }
        copy
    }

    fn warn_on_gaps(&self) {
        if self.coinbase.webhook_secret.is_empty() {
            warn!("coinbase.webhook_secret is empty; every webhook will be rejected");
        }
        if self.verifier.bot_token.is_empty() {
            warn!("verifier.bot_token is empty; ownership checks will fail");
        }
        if self.server.admin_token.is_none() {
            warn!("server.admin_token is unset; admin endpoints are disabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.escrow.transfer_window_hours, 168);
        assert_eq!(settings.settlement.platform_fee_bps, 500);
        assert!(settings.verifier.require_creator);
        assert_eq!(settings.sweeper.interval_secs, 60);
        assert!(settings.monitor.enabled);
        assert_eq!(settings.monitor.recheck_minutes, 30);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("trustlink-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
[server]
port = 9100
admin_token = "letmein"

[escrow]
transfer_window_hours = 48

[settlement]
platform_fee_bps = 250
gas_fee = "0.5"

[verifier]
require_creator = false

[verifier.retry]
max_attempts = 2

[monitor]
recheck_minutes = 5
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.escrow.transfer_window_hours, 48);
        assert!(settings.escrow.require_verified_listings);
        assert_eq!(settings.settlement.platform_fee_bps, 250);
        assert_eq!(settings.settlement.gas_fee, Decimal::from_str("0.5").unwrap());
        assert!(!settings.verifier.require_creator);
        assert_eq!(settings.verifier.retry.max_attempts, 2);
        assert_eq!(settings.verifier.retry.initial_backoff_ms, 500);
        assert_eq!(settings.node_config().monitor.recheck_minutes, 5);
        assert!(settings.monitor.enabled);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("trustlink-does-not-exist.toml");
        assert!(Settings::load(Some(&path)).is_err());
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut settings = Settings::default();
        settings.verifier.bot_token = "123:abc".to_string();
        settings.coinbase.api_key = Some("key".to_string());
        settings.server.admin_token = Some("admin".to_string());

        let shown = settings.redacted();
        assert_eq!(shown.verifier.bot_token, REDACTED);
        assert_eq!(shown.coinbase.api_key.as_deref(), Some(REDACTED));
        assert_eq!(shown.server.admin_token.as_deref(), Some(REDACTED));
        assert!(shown.coinbase.webhook_secret.is_empty());
    }
}
