use std::env;

/// Runtime configuration from environment variables.
///
/// Trading is off whenever either exchange credential is missing; the
/// scanner and the query surface keep working regardless.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub recv_window: u64,
    pub leverage: u32,
    pub refresh_interval_minutes: u64,
    pub ksl_buffer: f64,
    pub chat_token: Option<String>,
    pub chat_id: Option<String>,
    pub port: u16,
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            api_key: env_opt("EXCHANGE_API_KEY"),
            api_secret: env_opt("EXCHANGE_API_SECRET"),
            recv_window: env_u64("RECV_WINDOW", 5_000),
            leverage: env_u32("LEVERAGE", 5).max(1),
            refresh_interval_minutes: env_u64("REFRESH_INTERVAL_MINUTES", 10).max(1),
            ksl_buffer: env_f64("KSL_BUFFER", 1.0).clamp(0.5, 2.0),
            chat_token: env_opt("TELEGRAM_BOT_TOKEN"),
            chat_id: env_opt("TELEGRAM_CHAT_ID"),
            port: env_u16("PORT", 3_000),
        }
    }

    pub fn trading_enabled(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_helpers_fall_back_to_defaults() {
        assert_eq!(env_u64("MOVERBOT_TEST_UNSET_U64", 10), 10);
        assert_eq!(env_u16("MOVERBOT_TEST_UNSET_U16", 3_000), 3_000);
        assert_eq!(env_f64("MOVERBOT_TEST_UNSET_F64", 1.0), 1.0);
        assert!(env_opt("MOVERBOT_TEST_UNSET_OPT").is_none());
    }

    #[test]
    fn test_trading_requires_both_credentials() {
        let mut config = Config {
            api_key: Some("key".to_string()),
            api_secret: None,
            recv_window: 5_000,
            leverage: 5,
            refresh_interval_minutes: 10,
            ksl_buffer: 1.0,
            chat_token: None,
            chat_id: None,
            port: 3_000,
        };
        assert!(!config.trading_enabled());

        config.api_secret = Some("secret".to_string());
        assert!(config.trading_enabled());
    }
}
