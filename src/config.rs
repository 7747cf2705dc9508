// Runtime configuration: command line flags with environment fallbacks.

use crate::engine::EngineConfig;
use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use crate::utils::random_username;
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:6503";
pub const DEFAULT_TURN_URL: &str = "turn:localhost";
pub const DEFAULT_TURN_USERNAME: &str = "webrtc";
pub const DEFAULT_TURN_CREDENTIAL: &str = "turnserver";

// Debug builds log more by default
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "p2p_call_lib=debug,p2p_call=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "p2p_call_lib=info,p2p_call=info,webrtc=error";

#[derive(Debug, Clone, Parser)]
#[command(name = "p2p-call", version, about = "Peer-to-peer video call client")]
pub struct Config {
    /// WebSocket URL of the signaling server
    #[arg(long, env = "P2P_CALL_SIGNALING_URL", default_value = DEFAULT_SIGNALING_URL)]
    pub signaling_url: String,

    /// Display name to claim; random when omitted
    #[arg(long, env = "P2P_CALL_NAME")]
    pub name: Option<String>,

    /// STUN/TURN server; bare hosts are treated as TURN
    #[arg(
        long = "ice-server",
        env = "P2P_CALL_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_TURN_URL
    )]
    pub ice_servers: Vec<String>,

    #[arg(long, env = "P2P_CALL_TURN_USERNAME", default_value = DEFAULT_TURN_USERNAME)]
    pub turn_username: String,

    #[arg(long, env = "P2P_CALL_TURN_CREDENTIAL", default_value = DEFAULT_TURN_CREDENTIAL)]
    pub turn_credential: String,

    /// Abort a negotiation step that stalls this long; no limit when omitted
    #[arg(long, env = "P2P_CALL_NEGOTIATION_TIMEOUT_SECS")]
    pub negotiation_timeout_secs: Option<u64>,

    /// tracing filter directive, overrides RUST_LOG
    #[arg(long)]
    pub log: Option<String>,

    /// Disable logging entirely
    #[arg(long, short)]
    pub quiet: bool,
}

impl Config {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(random_username)
    }

    /// Configured ICE servers, validated.
    pub fn ice_servers(&self) -> Result<Vec<ServerConfig>, ConfigError> {
        let servers: Vec<ServerConfig> = self
            .ice_servers
            .iter()
            .map(|url| url.trim())
            .map(|url| {
                ServerConfig::from_url(
                    url,
                    Some(self.turn_username.clone()),
                    Some(self.turn_credential.clone()),
                )
            })
            .collect();
        validate_ice_servers(&servers)?;
        Ok(servers)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            negotiation_timeout: self.negotiation_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.signaling_url.starts_with("ws://") || self.signaling_url.starts_with("wss://")) {
            return Err(ConfigError::SignalingUrl {
                url: self.signaling_url.clone(),
                reason: "expected a ws:// or wss:// URL".into(),
            });
        }
        self.ice_servers().map(|_| ())
    }
}

/// Rejects empty URLs and TURN servers without credentials.
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.is_empty() {
            return Err(ConfigError::EmptyIceUrl);
        }

        let missing = |v: &Option<String>| v.as_deref().map_or(true, str::is_empty);
        if server.r#type == "turn" && (missing(&server.username) || missing(&server.credential)) {
            return Err(ConfigError::MissingTurnCredentials(server.url.clone()));
        }
    }
    Ok(())
}
