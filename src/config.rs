use std::collections::HashMap;
use std::env;

use crate::fees::{FeeCalculator, FeeSchedule};
use crate::payments::PaymentProcessor;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    pub webhook_secret: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub audit_database_path: String,
    pub stripe: Option<StripeConfig>,
    pub paypal: Option<PayPalConfig>,
    pub notify_webhook_url: Option<String>,
    pub audit_log_enabled: bool,
    pub dunning_max_attempts: u32,
    pub dev_mode: bool,
    fee_overrides: HashMap<PaymentProcessor, FeeSchedule>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("GIFTFLOW_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        // Both keys are required together; a processor with half its
        // credentials is a deployment mistake we want to catch at startup.
        let stripe = match (
            env::var("STRIPE_SECRET_KEY").ok(),
            env::var("STRIPE_WEBHOOK_SECRET").ok(),
        ) {
            (Some(secret_key), Some(webhook_secret)) => Some(StripeConfig {
                secret_key,
                webhook_secret,
                api_base: env::var("STRIPE_API_BASE")
                    .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            }),
            (None, None) => None,
            _ => panic!("STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET must be set together"),
        };

        let paypal = match (
            env::var("PAYPAL_CLIENT_ID").ok(),
            env::var("PAYPAL_CLIENT_SECRET").ok(),
            env::var("PAYPAL_WEBHOOK_ID").ok(),
            env::var("PAYPAL_WEBHOOK_SECRET").ok(),
        ) {
            (Some(client_id), Some(client_secret), Some(webhook_id), Some(webhook_secret)) => {
                Some(PayPalConfig {
                    client_id,
                    client_secret,
                    webhook_id,
                    webhook_secret,
                    api_base: env::var("PAYPAL_API_BASE")
                        .unwrap_or_else(|_| "https://api.paypal.com".to_string()),
                })
            }
            (None, None, None, None) => None,
            _ => panic!(
                "PAYPAL_CLIENT_ID, PAYPAL_CLIENT_SECRET, PAYPAL_WEBHOOK_ID and PAYPAL_WEBHOOK_SECRET must be set together"
            ),
        };

        let mut fee_overrides = HashMap::new();
        for processor in PaymentProcessor::ALL {
            let prefix = processor.as_str().to_uppercase();
            let bps = env::var(format!("{}_FEE_BPS", prefix))
                .ok()
                .and_then(|v| v.parse().ok());
            let fixed = env::var(format!("{}_FEE_FIXED_CENTS", prefix))
                .ok()
                .and_then(|v| v.parse().ok());
            if bps.is_some() || fixed.is_some() {
                let default = FeeSchedule::default_for(processor);
                fee_overrides.insert(
                    processor,
                    FeeSchedule {
                        percent_bps: bps.unwrap_or(default.percent_bps),
                        fixed_cents: fixed.unwrap_or(default.fixed_cents),
                    },
                );
            }
        }

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "giftflow.db".to_string()),
            audit_database_path: env::var("AUDIT_DATABASE_PATH")
                .unwrap_or_else(|_| "giftflow_audit.db".to_string()),
            stripe,
            paypal,
            notify_webhook_url: env::var("GIFTFLOW_NOTIFY_WEBHOOK_URL").ok(),
            audit_log_enabled: env::var("GIFTFLOW_AUDIT_LOG_ENABLED")
                .map(|v| v != "0" && v != "false")
                .unwrap_or(true),
            dunning_max_attempts: env::var("GIFTFLOW_DUNNING_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            dev_mode,
            fee_overrides,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fee calculator with defaults plus any env overrides.
    pub fn fee_calculator(&self) -> FeeCalculator {
        let mut schedules = HashMap::new();
        for processor in PaymentProcessor::ALL {
            let schedule = self
                .fee_overrides
                .get(&processor)
                .copied()
                .unwrap_or_else(|| FeeSchedule::default_for(processor));
            schedules.insert(processor, schedule);
        }
        FeeCalculator::new(schedules)
    }
}
