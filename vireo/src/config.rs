use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use vireo_core::{ChannelConfig, Limits, OperatorConfig, ServerConfig, TimeoutConfig};

#[serde_with::serde_as]
#[derive(Debug, Deserialize)]
struct TimeoutSection {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    activity: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    ping: Duration,
}

impl From<&TimeoutSection> for TimeoutConfig {
    fn from(val: &TimeoutSection) -> Self {
        TimeoutConfig {
            activity_timeout: val.activity,
            ping_timeout: val.ping,
        }
    }
}

/// Every limit is optional, missing ones keep their default.
#[derive(Debug, Default, Deserialize)]
struct LimitsSection {
    message_length: Option<usize>,
    nickname_length: Option<usize>,
    channel_name_length: Option<usize>,
    server_name_length: Option<usize>,
}

impl From<&LimitsSection> for Limits {
    fn from(val: &LimitsSection) -> Self {
        let default = Limits::default();
        Limits {
            max_message_length: val.message_length.unwrap_or(default.max_message_length),
            max_nickname_length: val.nickname_length.unwrap_or(default.max_nickname_length),
            max_channel_name_length: val
                .channel_name_length
                .unwrap_or(default.max_channel_name_length),
            max_server_name_length: val
                .server_name_length
                .unwrap_or(default.max_server_name_length),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OperatorSection {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct ChannelSection {
    name: String,
    key: Option<String>,
    topic: Option<String>,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6667
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server_name: String,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: Option<String>,
    motd: Option<String>,
    operator: Option<OperatorSection>,
    timeout: Option<TimeoutSection>,
    limits: Option<LimitsSection>,
    #[serde(default)]
    channel_creation: bool,
    #[serde(default)]
    channels: Vec<ChannelSection>,
}

impl Config {
    pub fn load_from_str(str: &str) -> Result<Self, anyhow::Error> {
        let config: Config = serde_yml::from_str(str)?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, anyhow::Error> {
        let string = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path:?}"))?;
        Config::load_from_str(string.as_str())
            .with_context(|| format!("parsing config file {path:?}"))
    }
}

fn channel_name(name: &str) -> String {
    if name.starts_with('#') {
        name.to_string()
    } else {
        format!("#{name}")
    }
}

impl Config {
    /// The password may come from the command line, so it is only required here.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let password = self
            .password
            .as_deref()
            .context("no connection password configured")?;

        let mut config = ServerConfig::new(&self.server_name, password);
        config.motd = self
            .motd
            .as_deref()
            .map(|motd| motd.lines().map(str::to_string).collect())
            .unwrap_or_default();
        config.operator = self.operator.as_ref().map(|operator| OperatorConfig {
            username: operator.username.clone(),
            password: operator.password.clone(),
        });
        if let Some(timeout) = &self.timeout {
            config.timeout = timeout.into();
        }
        if let Some(limits) = &self.limits {
            config.limits = limits.into();
        }
        config.channel_creation = self.channel_creation;
        config.channels = self
            .channels
            .iter()
            .map(|channel| ChannelConfig {
                name: channel_name(&channel.name),
                key: channel.key.clone(),
                topic: channel.topic.clone(),
            })
            .collect();
        Ok(config)
    }
}
