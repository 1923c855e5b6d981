//! Configuration for beagle-link
//!
//! Loaded from a TOML file. Every field has a default, so an empty file
//! describes the stock board at `beagle:2000`.

use crate::error::{Error, Result};
use crate::i2c::{ChannelSettings, DEFAULT_BUFFER_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_robot_name")]
    pub name: String,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceConfig>,
}

/// I2C proxy endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Board hostname or IP
    #[serde(default = "default_host")]
    pub host: String,

    /// Command socket port (default: 2000)
    #[serde(default = "default_command_port")]
    pub command_port: u16,

    /// Poll socket port (default: command_port + 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_port: Option<u16>,

    /// Socket connect timeout in milliseconds (default: 3000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Command send/receive timeout in milliseconds (default: 5000)
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Line buffer size of the command socket (default: 4000)
    #[serde(default = "default_buffer_size")]
    pub command_buffer_size: usize,

    /// Line buffer size of the poll socket (default: 4000)
    #[serde(default = "default_buffer_size")]
    pub poll_buffer_size: usize,
}

/// Watchdog timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchdogConfig {
    /// Time between passes in milliseconds (default: 5000)
    #[serde(default = "default_watchdog_interval")]
    pub interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A peripheral on the I2C bus
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub name: String,
    /// 7-bit I2C address
    pub address: u8,
    /// Register read to check the device is present (default: 0)
    #[serde(default)]
    pub probe_register: u8,
    /// Register writes issued on every connect, before polls are added
    #[serde(default)]
    pub setup: Vec<SetupWrite>,
    #[serde(default)]
    pub polls: Vec<PollConfig>,
}

/// A register write issued on connect
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct SetupWrite {
    pub register: u8,
    pub value: u8,
}

/// A register block polled while the device is connected
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollConfig {
    /// Poll period in milliseconds (default: 1000)
    #[serde(default = "default_poll_delay")]
    pub delay_ms: u32,
    pub register: u8,
    /// Number of consecutive registers (default: 1)
    #[serde(default = "default_poll_count")]
    pub count: usize,
}

fn default_robot_name() -> String {
    "beagle".to_string()
}
fn default_host() -> String {
    "beagle".to_string()
}
fn default_command_port() -> u16 {
    2000
}
fn default_connect_timeout() -> u64 {
    3000
}
fn default_io_timeout() -> u64 {
    5000
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
fn default_watchdog_interval() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_delay() -> u32 {
    1000
}
fn default_poll_count() -> usize {
    1
}

fn device(name: &str, address: u8, polls: &[(u8, usize)]) -> DeviceConfig {
    DeviceConfig {
        name: name.to_string(),
        address,
        probe_register: polls.first().map_or(0, |&(register, _)| register),
        setup: Vec::new(),
        polls: polls
            .iter()
            .map(|&(register, count)| PollConfig {
                delay_ms: default_poll_delay(),
                register,
                count,
            })
            .collect(),
    }
}

/// Peripherals fitted to the stock board
fn default_devices() -> Vec<DeviceConfig> {
    let battery_polls = [(0x06, 1), (0x0E, 2), (0x0C, 2), (0x0A, 2), (0x10, 2), (0x02, 2)];
    vec![
        device("Motor Controller", 0x10, &[(2, 1), (3, 1), (4, 1), (5, 1)]),
        device("Servo Controller", 0x20, &[]),
        device("Power Supply", 0x30, &[]),
        device("Battery A", 0x35, &battery_polls),
        device("Battery B", 0x34, &battery_polls),
        // Compass: continuous measurement mode, then X/Z/Y data registers
        DeviceConfig {
            probe_register: 0,
            setup: vec![SetupWrite {
                register: 2,
                value: 0,
            }],
            ..device("IMU", 0x1E, &[(0x03, 6)])
        },
        device("Ultrasonic Ranger", 0x70, &[(2, 2)]),
    ]
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            command_port: default_command_port(),
            poll_port: None,
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
            command_buffer_size: default_buffer_size(),
            poll_buffer_size: default_buffer_size(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_watchdog_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_robot_name(),
            proxy: ProxyConfig::default(),
            watchdog: WatchdogConfig::default(),
            logging: LoggingConfig::default(),
            devices: default_devices(),
        }
    }
}

impl ProxyConfig {
    pub fn poll_port(&self) -> u16 {
        self.poll_port
            .unwrap_or_else(|| self.command_port.wrapping_add(1))
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            host: self.host.clone(),
            command_port: self.command_port,
            poll_port: self.poll_port(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            command_buffer_size: self.command_buffer_size,
            poll_buffer_size: self.poll_buffer_size,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy.host.is_empty() {
            return Err(Error::Config("proxy.host is empty".into()));
        }
        if self.proxy.command_port == 0 || self.proxy.poll_port() == 0 {
            return Err(Error::Config("proxy ports must be non-zero".into()));
        }
        if self.proxy.command_buffer_size == 0 || self.proxy.poll_buffer_size == 0 {
            return Err(Error::Config("proxy buffer sizes must be non-zero".into()));
        }
        if self.watchdog.interval_ms == 0 {
            return Err(Error::Config("watchdog.interval_ms must be non-zero".into()));
        }
        for device in &self.devices {
            if device.address > 0x7f {
                return Err(Error::Config(format!(
                    "device '{}': address {:#04x} is not a 7-bit address",
                    device.name, device.address
                )));
            }
            for poll in &device.polls {
                if !(1..=255).contains(&poll.count) {
                    return Err(Error::Config(format!(
                        "device '{}': poll count {} outside 1..=255",
                        device.name, poll.count
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.proxy.host, "beagle");
        assert_eq!(config.proxy.command_port, 2000);
        assert_eq!(config.proxy.poll_port(), 2001);
        assert_eq!(config.watchdog.interval(), Duration::from_secs(5));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.devices.len(), 7);
        assert_eq!(config.devices[3].address, 0x35);
        assert_eq!(config.devices[3].probe_register, 0x06);

        let imu = &config.devices[5];
        assert_eq!((imu.name.as_str(), imu.address), ("IMU", 0x1E));
        assert_eq!((imu.setup[0].register, imu.setup[0].value), (2, 0));
        assert_eq!((imu.polls[0].register, imu.polls[0].count), (0x03, 6));
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
name = "rover"

[proxy]
host = "192.168.1.20"
command_port = 3000
poll_port = 3005
io_timeout_ms = 1000

[watchdog]
interval_ms = 250

[logging]
level = "debug"

[[devices]]
name = "Ranger"
address = 0x70

[[devices.setup]]
register = 0
value = 0x70

[[devices.polls]]
register = 2
count = 2
"#;

        let config = Config::parse(toml_content).unwrap();
        assert_eq!(config.devices[0].setup[0].value, 0x70);
        assert_eq!(config.name, "rover");
        assert_eq!(config.proxy.poll_port(), 3005);
        assert_eq!(config.proxy.command_buffer_size, 4000);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].polls[0].delay_ms, 1000);

        let settings = config.proxy.channel_settings();
        assert_eq!(settings.host, "192.168.1.20");
        assert_eq!(settings.io_timeout, Duration::from_secs(1));
        assert_eq!(settings.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();
        assert!(toml_string.contains("[proxy]"));
        assert!(toml_string.contains("[[devices]]"));

        let parsed = Config::parse(&toml_string).unwrap();
        assert_eq!(parsed.devices.len(), config.devices.len());
        assert_eq!(parsed.proxy.poll_port(), 2001);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::parse("[proxy]\nhost = \"\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::parse("[watchdog]\ninterval_ms = 0"),
            Err(Error::Config(_))
        ));
        let bad_poll = r#"
[[devices]]
name = "Motors"
address = 16

[[devices.polls]]
register = 2
count = 0
"#;
        assert!(matches!(Config::parse(bad_poll), Err(Error::Config(_))));
        assert!(matches!(Config::parse("name = 5"), Err(Error::TomlDe(_))));
    }
}
