//! Configuration loading for service deployments
//!
//! Merges an optional `courier-escrow` config file with `COURIER_`-prefixed
//! environment variables and hands out the per-component config structs.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::gateway::GatewayConfig;
use crate::payout_router::PayoutRouterConfig;
use crate::transaction_manager::TransactionManagerConfig;
use crate::webhook_reconciler::WebhookReconcilerConfig;
use crate::EscrowResult;

/// Flat deployment settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub service_fee_percent: i64,
    pub min_description_chars: usize,
    pub max_package_weight_kg: f64,
    pub code_length: usize,

    pub gateway_request_timeout_secs: u64,
    pub gateway_max_retry_attempts: u32,
    pub gateway_retry_backoff_ms: u64,

    pub supported_transfer_countries: Vec<String>,

    pub webhook_signing_secret: String,
}

impl Default for Settings {
    fn default() -> Self {
        let manager = TransactionManagerConfig::default();
        let gateway = GatewayConfig::default();
        let router = PayoutRouterConfig::default();
        let webhook = WebhookReconcilerConfig::default();

        Self {
            service_fee_percent: manager.service_fee_percent,
            min_description_chars: manager.min_description_chars,
            max_package_weight_kg: manager.max_package_weight_kg,
            code_length: manager.code_length,
            gateway_request_timeout_secs: gateway.request_timeout_secs,
            gateway_max_retry_attempts: gateway.max_retry_attempts,
            gateway_retry_backoff_ms: gateway.retry_backoff_ms,
            supported_transfer_countries: router
                .supported_transfer_countries
                .into_iter()
                .collect(),
            webhook_signing_secret: webhook.signing_secret,
        }
    }
}

impl Settings {
    /// Load settings from `courier-escrow.{toml,yaml,...}` and environment
    pub fn load() -> EscrowResult<Self> {
        let config = Config::builder()
            .add_source(File::with_name("courier-escrow").required(false))
            .add_source(Environment::with_prefix("COURIER"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Transaction manager configuration
    pub fn transaction_manager(&self) -> TransactionManagerConfig {
        TransactionManagerConfig {
            service_fee_percent: self.service_fee_percent,
            min_description_chars: self.min_description_chars,
            max_package_weight_kg: self.max_package_weight_kg,
            code_length: self.code_length,
        }
    }

    /// Payment gateway adapter configuration
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            request_timeout_secs: self.gateway_request_timeout_secs,
            max_retry_attempts: self.gateway_max_retry_attempts,
            retry_backoff_ms: self.gateway_retry_backoff_ms,
        }
    }

    /// Payout router configuration
    pub fn payout_router(&self) -> PayoutRouterConfig {
        PayoutRouterConfig {
            supported_transfer_countries: self
                .supported_transfer_countries
                .iter()
                .cloned()
                .collect(),
        }
    }

    /// Webhook reconciler configuration
    pub fn webhook_reconciler(&self) -> WebhookReconcilerConfig {
        WebhookReconcilerConfig {
            signing_secret: self.webhook_signing_secret.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_into_component_configs() {
        let settings = Settings::default();

        assert_eq!(settings.transaction_manager().service_fee_percent, 10);
        assert_eq!(settings.gateway().max_retry_attempts, 3);
        assert!(settings
            .payout_router()
            .supported_transfer_countries
            .contains("US"));
        assert!(!settings.webhook_reconciler().signing_secret.is_empty());
    }
}
