use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::model::{Ms, Score};
use crate::priority::PriorityConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Constraint(&'static str),
}

/// Daemon settings, read from `BOOKHOLD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding the WAL.
    pub data_dir: PathBuf,
    /// Prometheus listener port; disabled when unset.
    pub metrics_port: Option<u16>,
    /// JSON seed of catalog stock and requester standing.
    pub seed_path: Option<PathBuf>,
    pub hold_ttl: Duration,
    pub sweep_interval: Duration,
    /// Appends between WAL compactions.
    pub compact_threshold: u64,
    pub average_hold: Duration,
    pub standing_cache_ttl: Duration,
    pub priority_refresh: Duration,
    pub priority: PriorityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            seed_path: None,
            hold_ttl: Duration::from_secs(86_400),
            sweep_interval: Duration::from_secs(3_600),
            compact_threshold: 1_000,
            average_hold: Duration::from_secs(7 * 86_400),
            standing_cache_ttl: Duration::from_secs(300),
            priority_refresh: Duration::from_secs(3_600),
            priority: PriorityConfig::default(),
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(parse::<u64>(lookup, var)?.map(Duration::from_secs).unwrap_or(default))
}

fn as_ms(d: Duration) -> Ms {
    Ms::try_from(d.as_millis()).unwrap_or(Ms::MAX)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let p = d.priority;
        let config = Config {
            data_dir: lookup("BOOKHOLD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: parse(&lookup, "BOOKHOLD_METRICS_PORT")?,
            seed_path: lookup("BOOKHOLD_SEED_PATH").map(PathBuf::from),
            hold_ttl: secs(&lookup, "BOOKHOLD_HOLD_TTL_SECS", d.hold_ttl)?,
            sweep_interval: secs(&lookup, "BOOKHOLD_SWEEP_INTERVAL_SECS", d.sweep_interval)?,
            compact_threshold: parse(&lookup, "BOOKHOLD_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            average_hold: parse::<u64>(&lookup, "BOOKHOLD_AVERAGE_HOLD_DAYS")?
                .map(|days| Duration::from_secs(days.saturating_mul(86_400)))
                .unwrap_or(d.average_hold),
            standing_cache_ttl: secs(&lookup, "BOOKHOLD_STANDING_CACHE_SECS", d.standing_cache_ttl)?,
            priority_refresh: secs(&lookup, "BOOKHOLD_PRIORITY_REFRESH_SECS", d.priority_refresh)?,
            priority: PriorityConfig {
                wait_weight: parse::<Score>(&lookup, "BOOKHOLD_WEIGHT_WAIT")?.unwrap_or(p.wait_weight),
                urgency_weight: parse(&lookup, "BOOKHOLD_WEIGHT_URGENCY")?.unwrap_or(p.urgency_weight),
                late_weight: parse(&lookup, "BOOKHOLD_WEIGHT_LATE")?.unwrap_or(p.late_weight),
                membership_weight: parse(&lookup, "BOOKHOLD_WEIGHT_MEMBERSHIP")?
                    .unwrap_or(p.membership_weight),
                urgency_bonus: parse(&lookup, "BOOKHOLD_URGENCY_BONUS")?.unwrap_or(p.urgency_bonus),
                late_penalty_per_incident: parse(&lookup, "BOOKHOLD_LATE_PENALTY")?
                    .unwrap_or(p.late_penalty_per_incident),
                late_incident_cap: parse(&lookup, "BOOKHOLD_LATE_INCIDENT_CAP")?
                    .unwrap_or(p.late_incident_cap),
                membership_bonus: parse(&lookup, "BOOKHOLD_MEMBERSHIP_BONUS")?
                    .unwrap_or(p.membership_bonus),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Constraint("sweep interval must be positive"));
        }
        if self.compact_threshold == 0 {
            return Err(ConfigError::Constraint("compaction threshold must be positive"));
        }
        self.engine_settings()
            .validate()
            .map_err(ConfigError::Constraint)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            hold_ttl_ms: as_ms(self.hold_ttl),
            average_hold_ms: as_ms(self.average_hold),
            priority: self.priority,
            refresh_after_ms: as_ms(self.priority_refresh),
        }
    }

    pub fn standing_cache_ms(&self) -> Ms {
        as_ms(self.standing_cache_ttl)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookhold.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from(&[]).unwrap();
        assert_eq!(config, Config::default());
        let settings = config.engine_settings();
        assert_eq!(settings.hold_ttl_ms, 86_400_000);
        assert_eq!(settings.average_hold_ms, 7 * 86_400_000);
        assert_eq!(config.wal_path(), PathBuf::from("./data/bookhold.wal"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from(&[
            ("BOOKHOLD_DATA_DIR", "/var/lib/bookhold"),
            ("BOOKHOLD_METRICS_PORT", "9100"),
            ("BOOKHOLD_HOLD_TTL_SECS", "7200"),
            ("BOOKHOLD_AVERAGE_HOLD_DAYS", "14"),
            ("BOOKHOLD_WEIGHT_URGENCY", "0.1"),
            ("BOOKHOLD_LATE_PENALTY", "-2.5"),
            ("BOOKHOLD_LATE_INCIDENT_CAP", "3"),
        ])
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/bookhold"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.hold_ttl, Duration::from_secs(7200));
        assert_eq!(config.average_hold, Duration::from_secs(14 * 86_400));
        assert_eq!(config.priority.urgency_weight, Score::from_hundredths(10));
        assert_eq!(config.priority.late_penalty_per_incident, Score::from_hundredths(-250));
        assert_eq!(config.priority.late_incident_cap, 3);
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let err = from(&[("BOOKHOLD_SWEEP_INTERVAL_SECS", "hourly")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid { var: "BOOKHOLD_SWEEP_INTERVAL_SECS", value: "hourly".into() }
        );
    }

    #[test]
    fn constraints_are_enforced() {
        assert!(matches!(
            from(&[("BOOKHOLD_WEIGHT_WAIT", "-1")]),
            Err(ConfigError::Constraint(_))
        ));
        assert!(matches!(
            from(&[("BOOKHOLD_LATE_PENALTY", "5")]),
            Err(ConfigError::Constraint(_))
        ));
        assert!(matches!(
            from(&[("BOOKHOLD_HOLD_TTL_SECS", "0")]),
            Err(ConfigError::Constraint(_))
        ));
        assert!(matches!(
            from(&[("BOOKHOLD_SWEEP_INTERVAL_SECS", "0")]),
            Err(ConfigError::Constraint(_))
        ));
    }
}
