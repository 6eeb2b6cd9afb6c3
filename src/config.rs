//! Runtime configuration loaded from environment variables.
//!
//! `Config::from_env` reads the process environment (with `.env` support for
//! local development) and fails fast on anything missing or malformed, so a
//! bad deployment dies at startup instead of at the first payment.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::fmt;
use url::Url;

use crate::domain::Currency;

#[derive(Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub order_service_url: String,
    pub card: CardDirectConfig,
    pub aggregator: AggregatorConfig,
}

/// Credentials and tuning for the direct card gateway channel.
#[derive(Clone)]
pub struct CardDirectConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub supported_currencies: Vec<Currency>,
    pub timeout_secs: u64,
}

/// Credentials and tuning for the settlement aggregator channel.
#[derive(Clone)]
pub struct AggregatorConfig {
    pub api_base_url: String,
    pub merchant_id: String,
    pub api_secret: String,
    pub notify_url: String,
    pub return_url: String,
    pub supported_currencies: Vec<Currency>,
    pub timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid port number")?;
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?;
        let order_service_url = require_base_url("ORDER_SERVICE_URL")?;
        let timeout_secs = env::var("GATEWAY_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("GATEWAY_TIMEOUT_SECS must be a positive integer")?;

        let card = CardDirectConfig {
            api_base_url: require_base_url("CARD_API_BASE_URL")?,
            api_key: env::var("CARD_API_KEY").context("CARD_API_KEY must be set")?,
            webhook_secret: env::var("CARD_WEBHOOK_SECRET")
                .context("CARD_WEBHOOK_SECRET must be set")?,
            supported_currencies: parse_currency_list(
                &env::var("CARD_SUPPORTED_CURRENCIES")
                    .unwrap_or_else(|_| "CNY,USD,EUR,GBP,JPY,HKD,KRW,AUD,CAD".to_string()),
            )
            .context("CARD_SUPPORTED_CURRENCIES is malformed")?,
            timeout_secs,
        };

        let aggregator = AggregatorConfig {
            api_base_url: require_base_url("AGG_API_BASE_URL")?,
            merchant_id: env::var("AGG_MERCHANT_ID").context("AGG_MERCHANT_ID must be set")?,
            api_secret: env::var("AGG_API_SECRET").context("AGG_API_SECRET must be set")?,
            notify_url: require_base_url("AGG_NOTIFY_URL")?,
            return_url: require_base_url("AGG_RETURN_URL")?,
            supported_currencies: parse_currency_list(
                &env::var("AGG_SUPPORTED_CURRENCIES")
                    .unwrap_or_else(|_| "USD,EUR,GBP,HKD,CNY".to_string()),
            )
            .context("AGG_SUPPORTED_CURRENCIES is malformed")?,
            timeout_secs,
        };

        Ok(Config {
            server_host,
            server_port,
            database_url,
            database_max_connections,
            order_service_url,
            card,
            aggregator,
        })
    }
}

/// Reads a required env var and checks that it parses as an absolute URL.
fn require_base_url(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("{name} must be set"))?;
    Url::parse(&value).with_context(|| format!("{name} is not a valid URL: {value}"))?;
    Ok(value.trim_end_matches('/').to_string())
}

/// Parses a comma separated currency list such as "USD,EUR,JPY".
fn parse_currency_list(raw: &str) -> Result<Vec<Currency>> {
    let mut currencies = Vec::new();
    for code in raw.split(',') {
        let code = code.trim();
        if code.is_empty() {
            continue;
        }
        let currency = Currency::try_from(code)?;
        if !currencies.contains(&currency) {
            currencies.push(currency);
        }
    }
    if currencies.is_empty() {
        anyhow::bail!("currency list must name at least one currency");
    }
    Ok(currencies)
}

// Channel credentials must never leak through debug logging, so the secret
// fields are redacted by hand instead of deriving Debug.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("database_url", &"<redacted>")
            .field("database_max_connections", &self.database_max_connections)
            .field("order_service_url", &self.order_service_url)
            .field("card", &self.card)
            .field("aggregator", &self.aggregator)
            .finish()
    }
}

impl fmt::Debug for CardDirectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardDirectConfig")
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .field("supported_currencies", &self.supported_currencies)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl fmt::Debug for AggregatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorConfig")
            .field("api_base_url", &self.api_base_url)
            .field("merchant_id", &self.merchant_id)
            .field("api_secret", &"<redacted>")
            .field("notify_url", &self.notify_url)
            .field("return_url", &self.return_url)
            .field("supported_currencies", &self.supported_currencies)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_currency_list_accepts_codes() {
        let currencies = parse_currency_list("USD, eur ,JPY").unwrap();
        assert_eq!(
            currencies,
            vec![Currency::Usd, Currency::Eur, Currency::Jpy]
        );
    }

    #[test]
    fn test_parse_currency_list_deduplicates() {
        let currencies = parse_currency_list("USD,USD,EUR").unwrap();
        assert_eq!(currencies, vec![Currency::Usd, Currency::Eur]);
    }

    #[test]
    fn test_parse_currency_list_rejects_unknown_code() {
        assert!(parse_currency_list("USD,XYZ").is_err());
    }

    #[test]
    fn test_parse_currency_list_rejects_empty() {
        assert!(parse_currency_list(" , ,").is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let card = CardDirectConfig {
            api_base_url: "https://api.gateway.test".to_string(),
            api_key: "sk_live_secret".to_string(),
            webhook_secret: "whsec_secret".to_string(),
            supported_currencies: vec![Currency::Usd],
            timeout_secs: 30,
        };
        let rendered = format!("{card:?}");
        assert!(!rendered.contains("sk_live_secret"));
        assert!(!rendered.contains("whsec_secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
