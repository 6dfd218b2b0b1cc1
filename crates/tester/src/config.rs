//! Tester configuration management

use anyhow::{Context, Result, anyhow};
use bulk::{AllowedDeviceId, CancelToken, EchoTest, MAX_PACKET_SIZE, PollOptions, SessionOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest slot table the tester accepts
pub const MAX_DEVICE_SLOTS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TesterConfig {
    #[serde(default)]
    pub tester: TesterSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub echo: EchoSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TesterSettings {
    pub log_level: String,
}

impl Default for TesterSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// USB access settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices the tester may enumerate and open ("0xVID:0xPID")
    #[serde(default = "UsbSettings::default_allowed_devices")]
    pub allowed_devices: Vec<String>,
    /// Device slot table capacity
    #[serde(default = "UsbSettings::default_max_devices")]
    pub max_devices: usize,
    /// Bulk read timeout (e.g. "5s", "500ms")
    #[serde(default = "UsbSettings::default_timeout", with = "duration_serde")]
    pub read_timeout: Duration,
    /// Bulk write timeout
    #[serde(default = "UsbSettings::default_timeout", with = "duration_serde")]
    pub write_timeout: Duration,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            allowed_devices: Self::default_allowed_devices(),
            max_devices: Self::default_max_devices(),
            read_timeout: Self::default_timeout(),
            write_timeout: Self::default_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_allowed_devices() -> Vec<String> {
        ["0x8765:0x1234", "0x8765:0x1240", "0x8765:0x1241"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn default_max_devices() -> usize {
        bulk::DEFAULT_MAX_DEVICES
    }

    fn default_timeout() -> Duration {
        bulk::session::DEFAULT_READ_TIMEOUT
    }
}

/// Device discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Pause between scans while waiting for a device
    #[serde(default = "DiscoverySettings::default_interval", with = "duration_serde")]
    pub poll_interval: Duration,
    /// Stop waiting after this long ("0s" waits until a device appears)
    #[serde(default, with = "duration_serde")]
    pub poll_timeout: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            poll_interval: Self::default_interval(),
            poll_timeout: Duration::ZERO,
        }
    }
}

impl DiscoverySettings {
    fn default_interval() -> Duration {
        bulk::poll::DEFAULT_POLL_INTERVAL
    }
}

/// Echo test settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoSettings {
    /// Bytes per echo packet (1-64)
    #[serde(default = "EchoSettings::default_payload_len")]
    pub payload_len: usize,
    /// Compare echoed bytes, not just their count
    #[serde(default)]
    pub verify_data: bool,
    /// Product string the firmware should report; empty disables the check
    #[serde(default = "EchoSettings::default_expected_product")]
    pub expected_product: String,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            payload_len: Self::default_payload_len(),
            verify_data: false,
            expected_product: Self::default_expected_product(),
        }
    }
}

impl EchoSettings {
    fn default_payload_len() -> usize {
        bulk::echo::DEFAULT_PAYLOAD_LEN
    }

    fn default_expected_product() -> String {
        "Bulk test".to_string()
    }
}

/// Custom serde module for Duration
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "1h", "30m", "1h30m", "5s", "100ms"
    ///
    /// A bare number is taken as seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        if s.is_empty() {
            return Err("Empty duration".to_string());
        }

        let mut total = Duration::ZERO;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }
            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let part = match c {
                'h' => secs(num, 3600)?,
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    Duration::from_millis(num)
                }
                'm' => secs(num, 60)?,
                's' => Duration::from_secs(num),
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total += part;
        }

        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total += Duration::from_secs(num);
        }

        Ok(total)
    }

    fn secs(num: u64, unit: u64) -> Result<Duration, String> {
        num.checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration too large: {}", num))
    }

    pub fn format_duration(d: Duration) -> String {
        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;
        let millis = d.subsec_millis();

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 {
            result.push_str(&format!("{}s", secs));
        }
        if millis > 0 {
            result.push_str(&format!("{}ms", millis));
        }
        if result.is_empty() {
            result.push_str("0s");
        }
        result
    }
}

impl TesterConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-bulk-echo/tester.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: TesterConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-bulk-echo").join("tester.toml")
        } else {
            PathBuf::from(".config/usb-bulk-echo/tester.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.tester.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.tester.log_level,
                valid_levels.join(", ")
            ));
        }

        for device in &self.usb.allowed_devices {
            Self::validate_device_id(device)?;
        }

        if !(1..=MAX_DEVICE_SLOTS).contains(&self.usb.max_devices) {
            return Err(anyhow!(
                "Invalid max_devices {}, must be 1-{}",
                self.usb.max_devices,
                MAX_DEVICE_SLOTS
            ));
        }

        if self.usb.read_timeout.is_zero() || self.usb.write_timeout.is_zero() {
            return Err(anyhow!("USB read_timeout and write_timeout must be greater than 0"));
        }

        if self.discovery.poll_interval.is_zero() {
            return Err(anyhow!("Discovery poll_interval must be greater than 0"));
        }

        if !(1..=MAX_PACKET_SIZE).contains(&self.echo.payload_len) {
            return Err(anyhow!(
                "Invalid payload_len {}, must be 1-{}",
                self.echo.payload_len,
                MAX_PACKET_SIZE
            ));
        }

        Ok(())
    }

    /// Validate an allowed device entry (0xVID:0xPID)
    pub fn validate_device_id(device: &str) -> Result<()> {
        let parts: Vec<&str> = device.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid device '{}', expected VID:PID (e.g., '0x8765:0x1234')",
                device
            ));
        }

        Self::validate_hex_id(parts[0], "VID")?;
        Self::validate_hex_id(parts[1], "PID")?;
        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }

    /// Parsed allow-list
    pub fn allowed_ids(&self) -> Result<Vec<AllowedDeviceId>> {
        self.usb
            .allowed_devices
            .iter()
            .map(|s| {
                s.parse::<AllowedDeviceId>()
                    .with_context(|| format!("Invalid allowed device '{}'", s))
            })
            .collect()
    }

    pub fn session_options(&self, cancel: CancelToken) -> SessionOptions {
        SessionOptions {
            read_timeout: self.usb.read_timeout,
            write_timeout: self.usb.write_timeout,
            cancel: Some(cancel),
        }
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: self.discovery.poll_interval,
            timeout: self.discovery.poll_timeout,
        }
    }

    /// Echo test for `repeats` iterations with the configured packet settings
    pub fn echo_test(&self, repeats: u32) -> EchoTest {
        EchoTest::new(repeats)
            .with_payload_len(self.echo.payload_len)
            .with_verify_data(self.echo.verify_data)
    }
}
