use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid server name: {0:?}")]
    InvalidServerName(String),
    #[error("invalid channel name: {0:?}")]
    InvalidChannelName(String),
    #[error("invalid key for channel {0:?}")]
    InvalidChannelKey(String),
    #[error("channel {0:?} is declared twice")]
    DuplicateChannel(String),
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Idle time after which the server sends a PING.
    pub activity_timeout: Duration,
    /// Time left to the client to show any activity once the PING is sent.
    pub ping_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_secs(120),
            ping_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Limits {
    /// Longest accepted input line, terminator included.
    pub max_message_length: usize,
    pub max_nickname_length: usize,
    pub max_channel_name_length: usize,
    pub max_server_name_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_length: 512,
            max_nickname_length: 9,
            max_channel_name_length: 50,
            max_server_name_length: 63,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub username: String,
    pub password: String,
}

/// A channel that exists from startup, even while empty.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub key: Option<String>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_name: String,
    pub password: String,
    pub motd: Vec<String>,
    pub operator: Option<OperatorConfig>,
    pub timeout: TimeoutConfig,
    pub limits: Limits,
    /// Let JOIN create unknown channels.
    pub channel_creation: bool,
    pub channels: Vec<ChannelConfig>,
}

impl ServerConfig {
    pub fn new(server_name: &str, password: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            password: password.to_string(),
            motd: vec![],
            operator: None,
            timeout: TimeoutConfig::default(),
            limits: Limits::default(),
            channel_creation: false,
            channels: vec![],
        }
    }
}
