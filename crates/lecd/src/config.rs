//! LE client configuration.
//!
//! Defaults are the values in effect when the client starts. The LE service
//! daemon overrides most of them with a configuration message once it has
//! joined the emulated LAN; the rest can come from a TOML file.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Validated before use

use crate::error::{LecError, Result};
use crate::types::{AtmAddress, LaneVersion};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default number of frames flooded to the BUS per unresolved destination
pub const DEFAULT_MAX_UNKNOWN_FRAME_COUNT: u32 = 1;
/// Default aging time for LE_ARP entries (seconds)
pub const DEFAULT_AGING_TIME_SECS: u64 = 300;
/// Default aging time while a topology change is in effect (seconds)
pub const DEFAULT_FORWARD_DELAY_SECS: u64 = 15;
/// Default idle timeout for circuits whose MAC was never learned (seconds)
pub const DEFAULT_VCC_TIMEOUT_SECS: u64 = 1200;
/// Period of the aging sweep (seconds)
pub const DEFAULT_AGING_REFRESH_SECS: u64 = 3;
/// Default MTU of the emulated LAN
pub const DEFAULT_MTU: u32 = 1500;

/// Serialize durations as whole seconds, the unit the LES uses.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Runtime parameters of one LE client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LecConfig {
    /// Frames that may be flooded to the BUS before the destination resolves
    pub maximum_unknown_frame_count: u32,
    /// Window after which the flood counter is reset
    #[serde(with = "secs")]
    pub max_unknown_frame_time: Duration,
    /// LE_ARP retransmissions before the client stops asking
    pub max_retry_count: u16,
    #[serde(with = "secs")]
    pub aging_time: Duration,
    #[serde(with = "secs")]
    pub forward_delay_time: Duration,
    #[serde(with = "secs")]
    pub arp_response_time: Duration,
    #[serde(with = "secs")]
    pub flush_timeout: Duration,
    /// Fallback delay before switching to a data direct circuit without a
    /// flush confirmation
    #[serde(with = "secs")]
    pub path_switching_delay: Duration,
    #[serde(with = "secs")]
    pub vcc_timeout_period: Duration,
    #[serde(with = "secs")]
    pub aging_refresh_interval: Duration,
    pub lane_version: LaneVersion,
    pub mtu: u32,
    /// Proxy clients accept unicast frames for any destination
    pub is_proxy: bool,
    /// Our own ATM address, used to break simultaneous-setup ties
    pub local_atm_address: Option<AtmAddress>,
    /// Send a flush request when a data direct circuit becomes ready
    pub emit_flush_request: bool,
}

impl Default for LecConfig {
    fn default() -> Self {
        Self {
            maximum_unknown_frame_count: DEFAULT_MAX_UNKNOWN_FRAME_COUNT,
            max_unknown_frame_time: Duration::from_secs(1),
            max_retry_count: 1,
            aging_time: Duration::from_secs(DEFAULT_AGING_TIME_SECS),
            forward_delay_time: Duration::from_secs(DEFAULT_FORWARD_DELAY_SECS),
            arp_response_time: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(4),
            path_switching_delay: Duration::from_secs(6),
            vcc_timeout_period: Duration::from_secs(DEFAULT_VCC_TIMEOUT_SECS),
            aging_refresh_interval: Duration::from_secs(DEFAULT_AGING_REFRESH_SECS),
            lane_version: LaneVersion::V1,
            mtu: DEFAULT_MTU,
            is_proxy: false,
            local_atm_address: None,
            emit_flush_request: false,
        }
    }
}

impl LecConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the client cannot run with.
    ///
    /// # NIST Controls
    /// - CM-6: Configuration Settings - Configuration validation
    /// - SI-10: Information Input Validation
    pub fn validate(&self) -> Result<()> {
        if self.aging_refresh_interval.is_zero() {
            return Err(LecError::Config(
                "aging_refresh_interval must be non-zero".to_string(),
            ));
        }
        if self.aging_time.is_zero() {
            return Err(LecError::Config("aging_time must be non-zero".to_string()));
        }
        if self.mtu == 0 {
            return Err(LecError::Config("mtu must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Apply the parameters carried by a configuration message.
    ///
    /// The message does not carry `vcc_timeout_period`, the refresh interval
    /// or the local ATM address; those keep their current values. A message
    /// that would leave the configuration invalid is rejected as a whole.
    pub fn apply(&mut self, msg: &ConfigMessage) -> Result<()> {
        let mut next = self.clone();
        next.overwrite(msg);
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn overwrite(&mut self, msg: &ConfigMessage) {
        self.maximum_unknown_frame_count = msg.maximum_unknown_frame_count;
        self.max_unknown_frame_time = Duration::from_secs(msg.max_unknown_frame_time.into());
        self.max_retry_count = msg.max_retry_count;
        self.aging_time = Duration::from_secs(msg.aging_time.into());
        self.forward_delay_time = Duration::from_secs(msg.forward_delay_time.into());
        self.arp_response_time = Duration::from_secs(msg.arp_response_time.into());
        self.flush_timeout = Duration::from_secs(msg.flush_timeout.into());
        self.path_switching_delay = Duration::from_secs(msg.path_switching_delay.into());
        self.lane_version = msg.lane_version;
        self.mtu = msg.mtu;
        self.is_proxy = msg.is_proxy;
    }
}

/// Configuration record sent by the LE service daemon (timers in seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMessage {
    pub maximum_unknown_frame_count: u32,
    pub max_unknown_frame_time: u32,
    pub max_retry_count: u16,
    pub aging_time: u32,
    pub forward_delay_time: u32,
    pub arp_response_time: u32,
    pub flush_timeout: u32,
    pub path_switching_delay: u32,
    pub lane_version: LaneVersion,
    pub mtu: u32,
    pub is_proxy: bool,
}

impl From<&LecConfig> for ConfigMessage {
    fn from(config: &LecConfig) -> Self {
        let secs = |d: Duration| u32::try_from(d.as_secs()).unwrap_or(u32::MAX);
        Self {
            maximum_unknown_frame_count: config.maximum_unknown_frame_count,
            max_unknown_frame_time: secs(config.max_unknown_frame_time),
            max_retry_count: config.max_retry_count,
            aging_time: secs(config.aging_time),
            forward_delay_time: secs(config.forward_delay_time),
            arp_response_time: secs(config.arp_response_time),
            flush_timeout: secs(config.flush_timeout),
            path_switching_delay: secs(config.path_switching_delay),
            lane_version: config.lane_version,
            mtu: config.mtu,
            is_proxy: config.is_proxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LecConfig::default();
        assert_eq!(config.maximum_unknown_frame_count, 1);
        assert_eq!(config.max_unknown_frame_time, Duration::from_secs(1));
        assert_eq!(config.max_retry_count, 1);
        assert_eq!(config.aging_time, Duration::from_secs(300));
        assert_eq!(config.forward_delay_time, Duration::from_secs(15));
        assert_eq!(config.arp_response_time, Duration::from_secs(1));
        assert_eq!(config.flush_timeout, Duration::from_secs(4));
        assert_eq!(config.path_switching_delay, Duration::from_secs(6));
        assert_eq!(config.vcc_timeout_period, Duration::from_secs(1200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LecConfig::from_toml_str(
            r#"
            maximum_unknown_frame_count = 0
            aging_time = 60
            lane_version = "v2"
            local_atm_address = [0x47, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]
            "#,
        )
        .unwrap();

        assert_eq!(config.maximum_unknown_frame_count, 0);
        assert_eq!(config.aging_time, Duration::from_secs(60));
        assert_eq!(config.lane_version, LaneVersion::V2);
        assert_eq!(config.path_switching_delay, Duration::from_secs(6));
        assert!(config.local_atm_address.is_some());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(LecConfig::from_toml_str("aging_time = 0").is_err());
        assert!(LecConfig::from_toml_str("aging_time = \"soon\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "is_proxy = true\nmtu = 9000").unwrap();

        let config = LecConfig::from_file(file.path()).unwrap();
        assert!(config.is_proxy);
        assert_eq!(config.mtu, 9000);
    }

    #[test]
    fn test_apply_config_message() {
        let mut config = LecConfig::default();
        let mut msg = ConfigMessage::from(&config);
        msg.maximum_unknown_frame_count = 5;
        msg.aging_time = 120;
        msg.lane_version = LaneVersion::V2;

        config.apply(&msg).unwrap();
        assert_eq!(config.maximum_unknown_frame_count, 5);
        assert_eq!(config.aging_time, Duration::from_secs(120));
        assert_eq!(config.lane_version, LaneVersion::V2);
        assert_eq!(config.vcc_timeout_period, Duration::from_secs(1200));
    }

    #[test]
    fn test_invalid_config_message_keeps_previous_values() {
        let mut config = LecConfig::default();
        let mut msg = ConfigMessage::from(&config);
        msg.maximum_unknown_frame_count = 7;
        msg.mtu = 0;

        assert!(matches!(config.apply(&msg), Err(LecError::Config(_))));
        assert_eq!(config, LecConfig::default());

        msg.mtu = 1516;
        msg.aging_time = 0;
        assert!(config.apply(&msg).is_err());
        assert_eq!(config.maximum_unknown_frame_count, 1);
    }
}
