//! Chat transport configuration.

use std::time::Duration;

/// Environment variable holding the base API URL.
pub const ENV_API_URL: &str = "CHAT_API_URL";
/// Environment variable overriding the typing expiry, in milliseconds.
pub const ENV_TYPING_TIMEOUT_MS: &str = "CHAT_TYPING_TIMEOUT_MS";

/// Chat session configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Base HTTP(S) URL of the API. `None` makes every `open` fail with a
    /// configuration error.
    pub base_url: Option<String>,
    /// How long a typing indicator survives without a refresh.
    pub typing_timeout: Duration,
    /// Notices buffered for the caller before new ones are dropped.
    pub notice_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            typing_timeout: Duration::from_secs(3),
            notice_capacity: 256,
        }
    }
}

impl ChatConfig {
    /// Read configuration from the process environment.
    ///
    /// An unset or blank `CHAT_API_URL` leaves `base_url` empty; the error is
    /// raised later, when a connection is opened.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.base_url = std::env::var(ENV_API_URL)
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        if let Ok(raw) = std::env::var(ENV_TYPING_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.typing_timeout = Duration::from_millis(ms),
                _ => log::warn!("Ignoring invalid {ENV_TYPING_TIMEOUT_MS}={raw:?}"),
            }
        }
        config
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert!(config.base_url.is_none());
        assert_eq!(config.typing_timeout, Duration::from_secs(3));
        assert_eq!(config.notice_capacity, 256);
    }

    #[test]
    fn test_builders() {
        let config = ChatConfig::default()
            .with_base_url("https://api.example.com")
            .with_typing_timeout(Duration::from_millis(500));
        assert_eq!(config.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.typing_timeout, Duration::from_millis(500));
    }

    // The only test in the crate that touches these variables.
    #[test]
    fn test_from_env() {
        std::env::set_var(ENV_API_URL, "  https://api.example.com/  ");
        std::env::set_var(ENV_TYPING_TIMEOUT_MS, "1500");
        let config = ChatConfig::from_env();
        assert_eq!(config.base_url.as_deref(), Some("https://api.example.com/"));
        assert_eq!(config.typing_timeout, Duration::from_millis(1500));

        std::env::set_var(ENV_API_URL, "   ");
        std::env::set_var(ENV_TYPING_TIMEOUT_MS, "soon");
        let config = ChatConfig::from_env();
        assert!(config.base_url.is_none());
        assert_eq!(config.typing_timeout, Duration::from_secs(3));

        std::env::remove_var(ENV_API_URL);
        std::env::remove_var(ENV_TYPING_TIMEOUT_MS);
    }
}
