use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use neon_common::ids::DeviceId;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    Version(u32),
    #[error("invalid address {value:?} for {field}")]
    Address { field: &'static str, value: String },
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

// ─── Raw TOML input ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControllerConfigInput {
    pub version: u32,
    pub listen: ListenConfigInput,
    pub trigger: TriggerConfigInput,
    pub failover: FailoverConfigInput,
    pub qos: QosConfigInput,
    pub dispatch: DispatchConfigInput,
    pub devices: Vec<DeviceConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListenConfigInput {
    pub trigger_addr: Option<String>,
    pub digest_addr: Option<String>,
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriggerConfigInput {
    pub cooldown_ms: Option<u64>,
    pub overload_threshold: Option<f64>,
    pub ef_severity_threshold: Option<u8>,
    pub infrastructure_first: Option<u8>,
    pub infrastructure_last: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FailoverConfigInput {
    pub recovery_timeout_ms: Option<u64>,
    pub probe_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QosConfigInput {
    pub ef_reserved_bandwidth_pct: Option<u8>,
    pub ef_detour_threshold: Option<u8>,
    pub af_detour_threshold: Option<u8>,
    pub be_detour_threshold: Option<u8>,
    pub ef_protection_threshold: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfigInput {
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfigInput {
    pub id: String,
    pub addr: String,
}

// ─── Resolved config ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub trigger_addr: SocketAddr,
    pub digest_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            trigger_addr: SocketAddr::from(([0, 0, 0, 0], 50001)),
            digest_addr: SocketAddr::from(([0, 0, 0, 0], 50002)),
            metrics_addr: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Per-switch suppression window.
    pub cooldown: Duration,
    /// Estimated load at or above which a switch counts as overloaded.
    pub overload_threshold: f64,
    /// Severity at or above which EF protection is engaged.
    pub ef_severity_threshold: u8,
    /// Switch ids treated as infrastructure (never edge).
    pub infrastructure: RangeInclusive<u8>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(1000),
            overload_threshold: 0.70,
            ef_severity_threshold: 90,
            infrastructure: 9..=14,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Budget for quick recovery probing, measured from the primary failure.
    pub recovery_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            recovery_timeout: Duration::from_millis(30_000),
            probe_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosConfig {
    pub ef_reserved_bandwidth_pct: u8,
    pub ef_detour_threshold: u8,
    pub af_detour_threshold: u8,
    pub be_detour_threshold: u8,
    pub ef_protection_threshold: u8,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            ef_reserved_bandwidth_pct: 20,
            ef_detour_threshold: 90,
            af_detour_threshold: 75,
            be_detour_threshold: 70,
            ef_protection_threshold: 70,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub version: u32,
    pub listen: ListenConfig,
    pub trigger: TriggerConfig,
    pub failover: FailoverConfig,
    pub qos: QosConfig,
    /// Capacity of the control-action channel.
    pub channel_capacity: usize,
    /// Static source address → device mapping for the listeners.
    pub devices: HashMap<IpAddr, DeviceId>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            listen: ListenConfig::default(),
            trigger: TriggerConfig::default(),
            failover: FailoverConfig::default(),
            qos: QosConfig::default(),
            channel_capacity: 1024,
            devices: HashMap::new(),
        }
    }
}

fn parse_addr(field: &'static str, value: Option<String>) -> Result<Option<SocketAddr>, ConfigError> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Address { field, value: raw }),
    }
}

fn pct(field: &'static str, value: Option<u8>, default: u8) -> Result<u8, ConfigError> {
    let v = value.unwrap_or(default);
    if v > 100 {
        return Err(ConfigError::OutOfRange {
            field,
            value: v as u64,
            min: 0,
            max: 100,
        });
    }
    Ok(v)
}

fn at_least(field: &'static str, value: u64, min: u64) -> Result<u64, ConfigError> {
    if value < min {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max: u64::MAX,
        });
    }
    Ok(value)
}

impl ControllerConfigInput {
    pub fn resolve(self) -> Result<ControllerConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::Version(version));
        }

        let defaults = ControllerConfig::default();

        let listen = ListenConfig {
            trigger_addr: parse_addr("listen.trigger_addr", self.listen.trigger_addr)?
                .unwrap_or(defaults.listen.trigger_addr),
            digest_addr: parse_addr("listen.digest_addr", self.listen.digest_addr)?
                .unwrap_or(defaults.listen.digest_addr),
            metrics_addr: parse_addr("listen.metrics_addr", self.listen.metrics_addr)?,
        };

        let overload = self
            .trigger
            .overload_threshold
            .unwrap_or(defaults.trigger.overload_threshold)
            .clamp(0.0, 1.0);
        let first = self
            .trigger
            .infrastructure_first
            .unwrap_or(*defaults.trigger.infrastructure.start());
        let last = self
            .trigger
            .infrastructure_last
            .unwrap_or(*defaults.trigger.infrastructure.end());
        let trigger = TriggerConfig {
            cooldown: self
                .trigger
                .cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.trigger.cooldown),
            overload_threshold: overload,
            ef_severity_threshold: pct(
                "trigger.ef_severity_threshold",
                self.trigger.ef_severity_threshold,
                defaults.trigger.ef_severity_threshold,
            )?,
            infrastructure: first.min(last)..=first.max(last),
        };

        let failover = FailoverConfig {
            recovery_timeout: self
                .failover
                .recovery_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.failover.recovery_timeout),
            probe_interval: match self.failover.probe_interval_ms {
                Some(ms) => Duration::from_millis(at_least("failover.probe_interval_ms", ms, 10)?),
                None => defaults.failover.probe_interval,
            },
        };

        let q = defaults.qos;
        let qos = QosConfig {
            ef_reserved_bandwidth_pct: pct(
                "qos.ef_reserved_bandwidth_pct",
                self.qos.ef_reserved_bandwidth_pct,
                q.ef_reserved_bandwidth_pct,
            )?,
            ef_detour_threshold: pct(
                "qos.ef_detour_threshold",
                self.qos.ef_detour_threshold,
                q.ef_detour_threshold,
            )?,
            af_detour_threshold: pct(
                "qos.af_detour_threshold",
                self.qos.af_detour_threshold,
                q.af_detour_threshold,
            )?,
            be_detour_threshold: pct(
                "qos.be_detour_threshold",
                self.qos.be_detour_threshold,
                q.be_detour_threshold,
            )?,
            ef_protection_threshold: pct(
                "qos.ef_protection_threshold",
                self.qos.ef_protection_threshold,
                q.ef_protection_threshold,
            )?,
        };

        let mut devices = HashMap::new();
        for dev in self.devices {
            let id = dev.id.trim();
            if id.is_empty() {
                continue;
            }
            let ip: IpAddr = dev.addr.trim().parse().map_err(|_| ConfigError::Address {
                field: "devices.addr",
                value: dev.addr.clone(),
            })?;
            // First mapping for an address wins.
            devices.entry(ip).or_insert_with(|| DeviceId::new(id));
        }

        Ok(ControllerConfig {
            version,
            listen,
            trigger,
            failover,
            qos,
            channel_capacity: match self.dispatch.channel_capacity {
                Some(n) => at_least("dispatch.channel_capacity", n as u64, 16)? as usize,
                None => defaults.channel_capacity,
            },
            devices,
        })
    }
}

impl ControllerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(ControllerConfig::default());
        }
        let parsed: ControllerConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Device owning a source address, falling back to an address-derived id.
    pub fn device_for(&self, ip: IpAddr) -> DeviceId {
        self.devices
            .get(&ip)
            .cloned()
            .unwrap_or_else(|| DeviceId::from_addr(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_yields_defaults() {
        let cfg = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.trigger.cooldown, Duration::from_millis(1000));
        assert_eq!(cfg.trigger.infrastructure, 9..=14);
        assert_eq!(cfg.failover.recovery_timeout, Duration::from_secs(30));
        assert_eq!(cfg.failover.probe_interval, Duration::from_millis(500));
        assert_eq!(cfg.qos, QosConfig::default());
        assert_eq!(cfg.listen.trigger_addr.port(), 50001);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [listen]
            trigger_addr = "127.0.0.1:6000"
            metrics_addr = "127.0.0.1:9100"

            [trigger]
            cooldown_ms = 250
            infrastructure_first = 20
            infrastructure_last = 10

            [qos]
            af_detour_threshold = 80

            [[devices]]
            id = "device:s5"
            addr = "10.0.0.5"

            [[devices]]
            id = "device:dup"
            addr = "10.0.0.5"
        "#;

        let cfg = ControllerConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.listen.trigger_addr, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(cfg.listen.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
        assert_eq!(cfg.trigger.cooldown, Duration::from_millis(250));
        assert_eq!(cfg.trigger.infrastructure, 10..=20);
        assert_eq!(cfg.qos.af_detour_threshold, 80);
        assert_eq!(cfg.qos.ef_detour_threshold, 90);
        assert_eq!(
            cfg.device_for("10.0.0.5".parse().unwrap()),
            DeviceId::new("device:s5")
        );
        assert_eq!(
            cfg.device_for("10.0.0.9".parse().unwrap()),
            DeviceId::new("device:10.0.0.9")
        );
    }

    #[test]
    fn rejects_unknown_version() {
        let err = ControllerConfig::from_toml_str("version = 7").unwrap_err();
        assert!(matches!(err, ConfigError::Version(7)));
    }

    #[test]
    fn rejects_percentages_over_100() {
        let err = ControllerConfig::from_toml_str("[qos]\nbe_detour_threshold = 140").unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { value: 140, .. }));
    }

    #[test]
    fn rejects_probe_interval_below_minimum() {
        let err = ControllerConfig::from_toml_str("[failover]\nprobe_interval_ms = 5").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "failover.probe_interval_ms",
                value: 5,
                min: 10,
                ..
            }
        ));
        let cfg = ControllerConfig::from_toml_str("[failover]\nprobe_interval_ms = 10").unwrap();
        assert_eq!(cfg.failover.probe_interval, Duration::from_millis(10));
    }

    #[test]
    fn rejects_small_channel_capacity() {
        let err = ControllerConfig::from_toml_str("[dispatch]\nchannel_capacity = 4").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "dispatch.channel_capacity",
                value: 4,
                min: 16,
                ..
            }
        ));
    }

    #[test]
    fn rejects_bad_address() {
        let err =
            ControllerConfig::from_toml_str("[listen]\ndigest_addr = \"nope\"").unwrap_err();
        assert!(matches!(err, ConfigError::Address { .. }));
    }
}
