//! Set-policy command implementation.

use super::open_existing;
use ebbtide_core::{AdminOutcome, RetentionPolicy};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Parses a period such as `86400`, `90s`, `15m`, `12h`, `1d` or `2w`.
pub fn parse_period(input: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let trimmed = input.trim();
    let (digits, unit) = match trimmed.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((at, _)) => trimmed.split_at(at),
        None => (trimmed, "s"),
    };
    let count: u64 = digits
        .parse()
        .map_err(|_| format!("Invalid period: {:?}", input))?;
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        other => return Err(format!("Unknown period unit {:?} in {:?}", other, input).into()),
    };
    let secs = count
        .checked_mul(scale)
        .ok_or_else(|| format!("Period too large: {:?}", input))?;
    Ok(Duration::from_secs(secs))
}

/// Runs the set-policy command.
pub fn run(
    path: &Path,
    retain: u32,
    lookahead: u32,
    period: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let policy = RetentionPolicy::new(retain, lookahead, parse_period(period)?);
    info!("Setting retention policy of {:?}", path);
    let table = open_existing(path)?;

    match table.set_retention_policy(policy)? {
        AdminOutcome::Applied(policy) => println!(
            "✓ Retention set: {} periods back, {} ahead, {}s per period",
            policy.retain_periods,
            policy.lookahead_periods,
            policy.period_length.as_secs()
        ),
        AdminOutcome::AlreadySatisfied => println!("Policy unchanged - nothing to do"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn period_units() {
        assert_eq!(parse_period("86400").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_period("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_period("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_period("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_period("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_period("2w").unwrap(), Duration::from_secs(1_209_600));
    }

    #[test]
    fn period_rejects_garbage() {
        assert!(parse_period("").is_err());
        assert!(parse_period("d").is_err());
        assert!(parse_period("3y").is_err());
        assert!(parse_period("99999999999999999999d").is_err());
    }

    #[test]
    fn zero_period_rejected_by_table() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events");
        super::super::init::run(&path).unwrap();

        assert!(run(&path, 7, 1, "0").is_err());
        run(&path, 7, 1, "1d").unwrap();
    }
}
