// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{ConfigFile, RawConfigFile, RawDispatchSection, StoreConfig};
use crate::engine::{DispatchPolicy, RetryPolicy};
use crate::errors::{LaunchpadError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = LaunchpadError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let store = StoreConfig {
            mode: raw.store.mode,
            root: raw.store.root,
            retention: duration_field("store.retention", &raw.store.retention)?,
        };
        let dispatch = dispatch_policy(&raw.dispatch)?;
        validate_dispatch(&dispatch)?;

        if raw.provider.max_environments == 0 {
            return Err(LaunchpadError::ConfigError(
                "[provider].max_environments must be >= 1 (got 0)".to_string(),
            ));
        }

        Ok(ConfigFile::new_unchecked(
            store,
            dispatch,
            raw.tracker,
            raw.provider,
        ))
    }
}

/// Run the same checks `TryFrom` does, without keeping the result.
pub fn validate_config(raw: &RawConfigFile) -> Result<()> {
    ConfigFile::try_from(raw.clone()).map(|_| ())
}

fn dispatch_policy(raw: &RawDispatchSection) -> Result<DispatchPolicy> {
    let d = DispatchPolicy::default();

    let opt = |name: &str, value: &Option<String>, fallback: Duration| -> Result<Duration> {
        match value {
            Some(s) => duration_field(name, s),
            None => Ok(fallback),
        }
    };

    Ok(DispatchPolicy {
        provision_retry: RetryPolicy {
            max_attempts: raw
                .provision_attempts
                .unwrap_or(d.provision_retry.max_attempts),
            base_delay: opt(
                "dispatch.provision_base_delay",
                &raw.provision_base_delay,
                d.provision_retry.base_delay,
            )?,
            max_delay: opt(
                "dispatch.provision_max_delay",
                &raw.provision_max_delay,
                d.provision_retry.max_delay,
            )?,
        },
        request_timeout: opt("dispatch.request_timeout", &raw.request_timeout, d.request_timeout)?,
        provision_timeout: opt(
            "dispatch.provision_timeout",
            &raw.provision_timeout,
            d.provision_timeout,
        )?,
        poll_interval: opt("dispatch.poll_interval", &raw.poll_interval, d.poll_interval)?,
        transfer_attempts: raw.transfer_attempts.unwrap_or(d.transfer_attempts),
        transfer_retry_delay: opt(
            "dispatch.transfer_retry_delay",
            &raw.transfer_retry_delay,
            d.transfer_retry_delay,
        )?,
        transfer_timeout: opt(
            "dispatch.transfer_timeout",
            &raw.transfer_timeout,
            d.transfer_timeout,
        )?,
        start_timeout: opt("dispatch.start_timeout", &raw.start_timeout, d.start_timeout)?,
        run_window: opt("dispatch.run_window", &raw.run_window, d.run_window)?,
        max_command_len: raw.max_command_len.unwrap_or(d.max_command_len),
        terminate_on_finish: raw.terminate_on_finish.unwrap_or(d.terminate_on_finish),
    })
}

fn validate_dispatch(p: &DispatchPolicy) -> Result<()> {
    let err = |msg: String| Err(LaunchpadError::ConfigError(msg));

    if p.provision_retry.max_attempts == 0 {
        return err("[dispatch].provision_attempts must be >= 1 (got 0)".to_string());
    }
    if p.transfer_attempts == 0 {
        return err("[dispatch].transfer_attempts must be >= 1 (got 0)".to_string());
    }
    if p.provision_retry.base_delay > p.provision_retry.max_delay {
        return err(format!(
            "[dispatch].provision_base_delay ({:?}) exceeds provision_max_delay ({:?})",
            p.provision_retry.base_delay, p.provision_retry.max_delay
        ));
    }
    if p.max_command_len == 0 {
        return err("[dispatch].max_command_len must be >= 1 (got 0)".to_string());
    }

    for (name, value) in [
        ("request_timeout", p.request_timeout),
        ("provision_timeout", p.provision_timeout),
        ("poll_interval", p.poll_interval),
        ("transfer_timeout", p.transfer_timeout),
        ("start_timeout", p.start_timeout),
        ("run_window", p.run_window),
    ] {
        if value.is_zero() {
            return err(format!("[dispatch].{name} must be greater than zero"));
        }
    }

    Ok(())
}

fn duration_field(name: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| LaunchpadError::ConfigError(format!("invalid duration for {name}: {e}")))
}

/// Parse `"500ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large")),
        "h" => value
            .checked_mul(60 * 60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large")),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn rejects_durations_that_overflow() {
        assert!(parse_duration("18446744073709551615h").is_err());
        assert!(parse_duration("18446744073709551615m").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = ConfigFile::try_from(RawConfigFile::default()).unwrap();
        assert_eq!(cfg.dispatch, DispatchPolicy::default());
        assert_eq!(cfg.store.retention, Duration::from_secs(168 * 3600));
    }
}
