use std::time::Duration;

use relay_bus::DEFAULT_MAX_FRAME_BYTES;
use thiserror::Error;

use crate::cli::Cli;
use crate::controller::ReconnectPolicy;

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:55666";
pub const DEFAULT_SUBPROTOCOL: &str = "HadesLive";
pub const DEFAULT_LOG_FILTER: &str = "info,hades_relay=debug,relay_bus=info";
pub const DEFAULT_TWITCH_API_BASE: &str = "https://api.twitch.tv";
pub const DEFAULT_TWITCH_IRC_URL: &str = "ws://irc-ws.chat.twitch.tv:80";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("relay endpoint must be a ws:// or wss:// url, got `{0}`")]
    InvalidEndpoint(String),
    #[error("sub-protocol must not be empty")]
    EmptySubprotocol,
    #[error("max frame size must be greater than zero")]
    ZeroFrameLimit,
    #[error("reconnect multiplier must be at least 1.0, got {0}")]
    InvalidMultiplier(f64),
}

/// Where the relay socket lives and how it is negotiated.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub url: String,
    pub subprotocol: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT.to_string(),
            subprotocol: DEFAULT_SUBPROTOCOL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TwitchConfig {
    pub api_base: String,
    pub client_id: String,
    pub irc_url: String,
    pub channel: Option<String>,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_TWITCH_API_BASE.to_string(),
            client_id: String::new(),
            irc_url: DEFAULT_TWITCH_IRC_URL.to_string(),
            channel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub endpoint: EndpointConfig,
    pub max_frame_bytes: usize,
    pub reconnect: ReconnectPolicy,
    pub twitch: TwitchConfig,
    pub log_filter: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reconnect: ReconnectPolicy::default(),
            twitch: TwitchConfig::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl TryFrom<&Cli> for RelayConfig {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let endpoint = cli.endpoint.trim();
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(ConfigError::InvalidEndpoint(endpoint.to_string()));
        }
        if cli.subprotocol.trim().is_empty() {
            return Err(ConfigError::EmptySubprotocol);
        }
        if cli.max_frame_bytes == 0 {
            return Err(ConfigError::ZeroFrameLimit);
        }
        if !(cli.reconnect_multiplier >= 1.0) {
            return Err(ConfigError::InvalidMultiplier(cli.reconnect_multiplier));
        }

        let reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(cli.reconnect_delay_ms),
            multiplier: cli.reconnect_multiplier,
            max_delay: Duration::from_millis(cli.reconnect_max_delay_ms.max(cli.reconnect_delay_ms)),
            max_attempts: cli.reconnect_max_attempts.filter(|attempts| *attempts > 0),
        };

        Ok(Self {
            endpoint: EndpointConfig {
                url: endpoint.to_string(),
                subprotocol: cli.subprotocol.trim().to_string(),
            },
            max_frame_bytes: cli.max_frame_bytes,
            reconnect,
            twitch: TwitchConfig {
                api_base: cli.twitch_api_base.trim_end_matches('/').to_string(),
                client_id: cli.twitch_client_id.clone().unwrap_or_default(),
                irc_url: cli.twitch_irc_url.clone(),
                channel: cli.channel().map(str::to_string),
            },
            log_filter: cli
                .log_filter
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["hades-relay"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("cli parses")
    }

    #[test]
    fn defaults_match_the_local_relay() {
        let cfg = RelayConfig::try_from(&parse(&[])).expect("config");
        assert_eq!(cfg.endpoint, EndpointConfig::default());
        assert_eq!(cfg.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(cfg.reconnect.initial_delay, Duration::ZERO);
        assert_eq!(cfg.reconnect.max_attempts, None);
        assert_eq!(cfg.twitch.api_base, DEFAULT_TWITCH_API_BASE);
    }

    #[test]
    fn reconnect_flags_build_a_policy() {
        let cfg = RelayConfig::try_from(&parse(&[
            "--reconnect-delay-ms",
            "250",
            "--reconnect-multiplier",
            "2",
            "--reconnect-max-delay-ms",
            "4000",
            "--reconnect-max-attempts",
            "5",
        ]))
        .expect("config");
        assert_eq!(cfg.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(cfg.reconnect.max_delay, Duration::from_secs(4));
        assert_eq!(cfg.reconnect.max_attempts, Some(5));
    }

    #[test]
    fn run_channel_lands_in_twitch_config() {
        let cfg = RelayConfig::try_from(&parse(&["run", "--channel", "supergiant"]))
            .expect("config");
        assert_eq!(cfg.twitch.channel.as_deref(), Some("supergiant"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            RelayConfig::try_from(&parse(&["--endpoint", "http://localhost:1"])),
            Err(ConfigError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            RelayConfig::try_from(&parse(&["--reconnect-multiplier", "0.5"])),
            Err(ConfigError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            RelayConfig::try_from(&parse(&["--max-frame-bytes", "0"])),
            Err(ConfigError::ZeroFrameLimit)
        ));
    }
}
