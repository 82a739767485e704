//! Server configuration sourced from the environment
//!
//! Every setting has a default so the relay starts with no environment at
//! all. Invalid values fall back to the default with a warning rather than
//! aborting startup.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default alphabet for group codes: the 62 alphanumeric symbols.
pub const DEFAULT_CODE_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP address the QUIC endpoint binds to
    pub bind_addr: SocketAddr,
    /// SNI allow-list; empty means allow all
    pub allowed_origins: Vec<String>,
    /// Transport keepalive interval
    pub keepalive: Duration,
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// How long a couple waiter stays in the pool before `no_match_found`
    pub match_timeout: Duration,
    /// Typing indicator soft expiry
    pub typing_expiry: Duration,
    /// Per-session outbound queue depth
    pub queue_depth: usize,
    /// Group code length
    pub code_len: usize,
    /// Group code alphabet
    pub code_alphabet: String,
    /// Maximum concurrent sessions; further connections are refused
    pub max_sessions: usize,
    /// Legacy couple matchmaking flag
    pub enable_couple: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4433".parse().expect("valid default address"),
            allowed_origins: Vec::new(),
            keepalive: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            match_timeout: Duration::from_secs(60),
            typing_expiry: Duration::from_secs(5),
            queue_depth: 256,
            code_len: 6,
            code_alphabet: DEFAULT_CODE_ALPHABET.to_string(),
            max_sessions: 10_000,
            enable_couple: true,
        }
    }
}

impl Config {
    /// Build a configuration from `MURMUR_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let bind_addr = parse_var("MURMUR_BIND_ADDR", defaults.bind_addr);
        let allowed_origins = env::var("MURMUR_ALLOWED_ORIGINS")
            .map(|v| parse_origin_list(&v))
            .unwrap_or_default();
        let keepalive = secs_var("MURMUR_KEEPALIVE_SECS", defaults.keepalive);
        let idle_timeout = secs_var("MURMUR_IDLE_TIMEOUT_SECS", defaults.idle_timeout);
        let match_timeout = secs_var("MURMUR_MATCH_TIMEOUT_SECS", defaults.match_timeout);
        let queue_depth = parse_var("MURMUR_QUEUE_DEPTH", defaults.queue_depth).max(1);
        let code_len = parse_var("MURMUR_CODE_LEN", defaults.code_len).max(1);
        let code_alphabet = env::var("MURMUR_CODE_ALPHABET")
            .ok()
            .filter(|a| !a.is_empty())
            .unwrap_or(defaults.code_alphabet);
        let max_sessions = parse_var("MURMUR_MAX_SESSIONS", defaults.max_sessions).max(1);
        let enable_couple = parse_var("MURMUR_ENABLE_COUPLE", defaults.enable_couple);

        Self {
            bind_addr,
            allowed_origins,
            keepalive,
            idle_timeout,
            match_timeout,
            typing_expiry: defaults.typing_expiry,
            queue_depth,
            code_len,
            code_alphabet,
            max_sessions,
            enable_couple,
        }
    }

    /// Whether the SNI allow-list admits this server name.
    pub fn origin_allowed(&self, server_name: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match server_name {
            Some(name) => self.allowed_origins.iter().any(|o| o == name),
            None => false,
        }
    }
}

fn parse_var<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("invalid value for {}: {:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn secs_var(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_var(key, default.as_secs()))
}

fn parse_origin_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 4433);
        assert_eq!(config.queue_depth, 256);
        assert_eq!(config.code_len, 6);
        assert_eq!(config.code_alphabet.len(), 62);
        assert_eq!(config.typing_expiry, Duration::from_secs(5));
        assert!(config.enable_couple);
    }

    #[test]
    fn test_origin_list_parsing() {
        let origins = parse_origin_list(" chat.example.org ,, relay.example.org ");
        assert_eq!(origins, vec!["chat.example.org", "relay.example.org"]);
        assert!(parse_origin_list("").is_empty());
    }

    #[test]
    fn test_origin_allowed() {
        let mut config = Config::default();
        assert!(config.origin_allowed(None));
        assert!(config.origin_allowed(Some("anything")));

        config.allowed_origins = vec!["chat.example.org".to_string()];
        assert!(config.origin_allowed(Some("chat.example.org")));
        assert!(!config.origin_allowed(Some("evil.example.org")));
        assert!(!config.origin_allowed(None));
    }
}
