//! Dynamic per-group configuration
//!
//! Settings arrive through a mounted directory of files (one file per key,
//! ConfigMap style) named `global.<key>` or `group.<name>.<key>`. Lookup
//! order is group, then global, then the built-in default, so operators can
//! set a fleet-wide policy and carve out exceptions per instance group.
//!
//! The whole map is re-read every reconciliation tick; a value that fails
//! validation aborts the reload and the previous settings stay in force.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::{trace, warn};

use crate::cron::Schedule;
use crate::selector::Selector;
use crate::{Error, Result};

const DEFAULTS: &[(&str, &str)] = &[
    ("maxSurge", "1"),
    ("maxUnavailable", "0"),
    ("deleteOldLaunchConfig", "false"),
    ("deletionAge", ""),
    ("deletionAgeJitter", ""),
    ("deletionSchedule", ""),
    ("startupGracePeriod", ""),
    ("ignoreSelector", crate::DEFAULT_IGNORE_SELECTOR),
    ("ignore", "false"),
];

fn default_for(key: &str) -> Option<&'static str> {
    DEFAULTS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Parse a duration string
///
/// Accepts the conventional `ns`/`us`/`ms`/`s`/`m`/`h` units, possibly
/// chained (`1h30m`), with the addition of a whole-number `d` (day) suffix
/// meaning 24 hours (`30d`).
pub fn parse_duration(s: &str) -> Result<Duration> {
    if s.is_empty() {
        return Err(Error::config("duration", "empty duration"));
    }
    if let Some(days) = s.strip_suffix('d') {
        let n = days.parse::<u64>().map_err(|_| {
            Error::config("duration", format!("invalid number of days in '{}'", s))
        })?;
        return Ok(Duration::from_secs(n * 24 * 60 * 60));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| Error::config("duration", format!("missing unit in '{}'", s)))?;
        if num_end == 0 {
            return Err(Error::config("duration", format!("invalid duration '{}'", s)));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| Error::config("duration", format!("invalid number in '{}'", s)))?;

        let unit_len = rest[num_end..]
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len() - num_end);
        let unit = &rest[num_end..num_end + unit_len];
        let unit_secs = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => {
                return Err(Error::config(
                    "duration",
                    format!("unknown unit '{}' in '{}'", unit, s),
                ))
            }
        };
        total += Duration::from_secs_f64(value * unit_secs);
        rest = &rest[num_end + unit_len..];
    }
    Ok(total)
}

/// Interpret a budget value as an absolute count or a percentage of `total`
///
/// Percentages round up for surge budgets and down for unavailability
/// budgets. Unparseable values degrade to zero, the safe budget.
pub fn percent_or_count(value: &str, total: i64, round_up: bool) -> i64 {
    if let Some(pct) = value.strip_suffix('%') {
        return match pct.parse::<f64>() {
            Ok(p) => {
                let scaled = total as f64 * p / 100.0;
                if round_up {
                    scaled.ceil() as i64
                } else {
                    scaled as i64
                }
            }
            Err(_) => {
                warn!(value, "could not parse budget as percentage");
                0
            }
        };
    }
    match value.parse::<i64>() {
        Ok(n) => n,
        Err(_) => {
            warn!(value, "could not parse budget as integer");
            0
        }
    }
}

/// Hot-reloadable per-group settings map
#[derive(Debug, Default)]
pub struct DynamicConfig {
    settings: HashMap<String, HashMap<String, String>>,
}

impl DynamicConfig {
    /// Reload settings from the given directory
    ///
    /// A missing directory leaves the current settings untouched (the
    /// controller may run without a mounted config). Any file whose value
    /// fails validation aborts the reload.
    pub fn reload(&mut self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            trace!(dir = %dir.display(), "config directory does not exist, skipping reload");
            return Ok(());
        }

        let mut raw = HashMap::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::config("configDir", format!("reading {}: {}", dir.display(), e)))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| Error::config("configDir", format!("reading entry: {}", e)))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() || name.starts_with('.') {
                continue;
            }
            let contents = std::fs::read_to_string(entry.path())
                .map_err(|e| Error::config(name.clone(), format!("reading file: {}", e)))?;
            raw.insert(name, contents);
        }
        self.load_from_map(&raw)
    }

    /// Load settings from a flat `file name → contents` map
    pub fn load_from_map(&mut self, raw: &HashMap<String, String>) -> Result<()> {
        let mut incoming: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (file, contents) in raw {
            let parts: Vec<&str> = file.split('.').collect();
            let (group, setting) = match parts.as_slice() {
                ["global", setting] => (String::new(), *setting),
                // Group names may themselves contain dots
                ["group", middle @ .., setting] if !middle.is_empty() => {
                    (middle.join("."), *setting)
                }
                _ => {
                    warn!(key = %file, "ignoring unrecognized settings key");
                    continue;
                }
            };
            let value = contents.trim();
            validate(setting, value)?;
            incoming
                .entry(group)
                .or_default()
                .insert(setting.to_string(), value.to_string());
        }
        self.settings = incoming;
        Ok(())
    }

    fn lookup(&self, group: &str, key: &str) -> Option<&str> {
        self.settings
            .get(group)
            .and_then(|m| m.get(key))
            .or_else(|| self.settings.get("").and_then(|m| m.get(key)))
            .map(String::as_str)
            .or_else(|| default_for(key))
    }

    /// Get a string setting for the given group
    pub fn get_string(&self, group: &str, key: &str) -> String {
        self.lookup(group, key).unwrap_or_default().to_string()
    }

    /// Get a boolean setting for the given group
    pub fn get_bool(&self, group: &str, key: &str) -> bool {
        match self.lookup(group, key) {
            Some("true") => true,
            Some("false") | None => false,
            Some(other) => {
                warn!(key, value = other, "setting is not a boolean, using false");
                false
            }
        }
    }

    /// Get a duration setting for the given group; unset means `None`
    pub fn get_duration(&self, group: &str, key: &str) -> Option<Duration> {
        let raw = self.lookup(group, key)?;
        if raw.is_empty() {
            return None;
        }
        match parse_duration(raw) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(key, error = %e, "invalid duration setting, ignoring");
                None
            }
        }
    }

    /// Get a cron schedule setting for the given group; unset means `None`
    pub fn get_schedule(&self, group: &str, key: &str) -> Option<Schedule> {
        let raw = self.lookup(group, key)?;
        if raw.is_empty() {
            return None;
        }
        match Schedule::parse(raw) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(key, error = %e, "invalid schedule setting, ignoring");
                None
            }
        }
    }
}

fn validate(setting: &str, value: &str) -> Result<()> {
    match setting {
        "maxSurge" | "maxUnavailable" => {
            let numeric = value.strip_suffix('%').unwrap_or(value);
            if value.ends_with('%') {
                numeric.parse::<f64>().map(|_| ()).map_err(|_| {
                    Error::config(setting, format!("invalid percentage '{}'", value))
                })
            } else {
                numeric.parse::<i64>().map(|_| ()).map_err(|_| {
                    Error::config(setting, format!("invalid integer '{}'", value))
                })
            }
        }
        "deleteOldLaunchConfig" | "ignore" => match value {
            "true" | "false" => Ok(()),
            _ => Err(Error::config(
                setting,
                format!("'{}' is neither 'true' nor 'false'", value),
            )),
        },
        "deletionAge" | "deletionAgeJitter" | "startupGracePeriod" => {
            if value.is_empty() {
                Ok(())
            } else {
                parse_duration(value).map(|_| ())
            }
        }
        "deletionSchedule" => {
            if value.is_empty() {
                Ok(())
            } else {
                Schedule::parse(value).map(|_| ())
            }
        }
        "ignoreSelector" => {
            if value.is_empty() {
                Ok(())
            } else {
                Selector::parse(value).map(|_| ())
            }
        }
        _ => {
            warn!(setting, "unknown setting, accepted but unused");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> DynamicConfig {
        let raw = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut cfg = DynamicConfig::default();
        cfg.load_from_map(&raw).unwrap();
        cfg
    }

    #[test]
    fn test_parse_duration_days() {
        assert_eq!(
            parse_duration("7d").unwrap(),
            Duration::from_secs(7 * 24 * 60 * 60)
        );
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_duration_conventional() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(90 * 60)
        );
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("3x").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("1.5d").is_err());
        assert!(parse_duration("30").is_err());
    }

    #[test]
    fn test_percent_or_count_rounding() {
        // Surge percentages round up, unavailability percentages round down
        assert_eq!(percent_or_count("10%", 15, true), 2);
        assert_eq!(percent_or_count("10%", 15, false), 1);
        assert_eq!(percent_or_count("50%", 10, true), 5);
        assert_eq!(percent_or_count("3", 10, true), 3);
        assert_eq!(percent_or_count("junk", 10, true), 0);
        assert_eq!(percent_or_count("junk%", 10, false), 0);
    }

    #[test]
    fn test_lookup_order_group_global_default() {
        let cfg = config_from(&[
            ("global.maxSurge", "4"),
            ("group.workers.maxSurge", "2"),
        ]);

        assert_eq!(cfg.get_string("workers", "maxSurge"), "2");
        assert_eq!(cfg.get_string("other", "maxSurge"), "4");

        let empty = DynamicConfig::default();
        assert_eq!(empty.get_string("other", "maxSurge"), "1");
        assert_eq!(empty.get_string("other", "maxUnavailable"), "0");
        assert!(!empty.get_bool("other", "ignore"));
    }

    #[test]
    fn test_group_names_may_contain_dots() {
        let cfg = config_from(&[("group.workers.us-west-2.ignore", "true")]);
        assert!(cfg.get_bool("workers.us-west-2", "ignore"));
        assert!(!cfg.get_bool("workers", "ignore"));
    }

    #[test]
    fn test_typed_getters() {
        let cfg = config_from(&[
            ("global.deletionAge", "30d"),
            ("global.deletionSchedule", "* 2-4 * * *"),
            ("global.deleteOldLaunchConfig", "true"),
        ]);

        assert_eq!(
            cfg.get_duration("g", "deletionAge"),
            Some(Duration::from_secs(30 * 86_400))
        );
        assert!(cfg.get_duration("g", "startupGracePeriod").is_none());
        assert!(cfg.get_schedule("g", "deletionSchedule").is_some());
        assert!(cfg.get_bool("g", "deleteOldLaunchConfig"));
    }

    #[test]
    fn test_reload_rejects_invalid_values_keeping_previous() {
        let mut cfg = config_from(&[("global.maxSurge", "3")]);

        let bad = [
            ("global.deletionAge".to_string(), "soon".to_string()),
        ]
        .into_iter()
        .collect();
        assert!(cfg.load_from_map(&bad).is_err());

        // Previous settings survive the failed reload
        assert_eq!(cfg.get_string("g", "maxSurge"), "3");
    }

    #[test]
    fn test_unrecognized_file_names_are_skipped() {
        let cfg = config_from(&[("README", "hello"), ("global.maxSurge", "2")]);
        assert_eq!(cfg.get_string("g", "maxSurge"), "2");
    }
}
