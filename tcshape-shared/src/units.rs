//! Engineering-unit parsing and formatting.
//!
//! Values are normalized to milliseconds (time), bits per second (rate) and
//! fraction of one (percentages). The same functions are used for user input
//! and for values read back from `tc ... show` output, so a rule written with
//! `--delay 0.1s` is found again when tc reports `delay 100ms`.

use crate::errors::{TcshapeError, TcshapeResult};

/// Upper bandwidth bound of iproute2 (older than 3.14.0 capped rates at
/// 34,359,738,360 bit/s), used when an interface does not report a speed.
pub const IPROUTE2_UPPER_LIMIT_BPS: u64 = 32_000_000_000;

/// Splits `"12.5ms"` into `(12.5, "ms")`.
fn split_number(value: &str) -> Option<(f64, &str)> {
    let value = value.trim();
    let end = value
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+'))
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    if end == 0 {
        return None;
    }
    let number = value[..end].parse::<f64>().ok()?;
    if !number.is_finite() {
        return None;
    }
    Some((number, value[end..].trim()))
}

/// Parse a time value into milliseconds.
///
/// A bare number is taken as milliseconds.
pub fn parse_time_ms(value: &str) -> TcshapeResult<f64> {
    let (number, unit) =
        split_number(value).ok_or_else(|| TcshapeError::invalid("time", value, "not a number"))?;
    if number < 0.0 {
        return Err(TcshapeError::invalid("time", value, "must not be negative"));
    }

    let factor = match unit.to_ascii_lowercase().as_str() {
        "" | "ms" | "msec" | "msecs" => 1.0,
        "us" | "usec" | "usecs" => 0.001,
        "s" | "sec" | "secs" => 1000.0,
        "m" | "min" | "mins" => 60_000.0,
        _ => {
            return Err(TcshapeError::invalid(
                "time",
                value,
                format!("unknown time unit '{}'", unit),
            ));
        }
    };

    Ok(round_ms(number * factor))
}

/// Parse a percentage into a fraction of one.
///
/// `"10%"` and `"0.1"` both yield `0.1`.
pub fn parse_fraction(value: &str) -> TcshapeResult<f64> {
    let trimmed = value.trim();
    let (number, fraction) = match trimmed.strip_suffix('%') {
        Some(percent) => {
            let number = percent
                .trim()
                .parse::<f64>()
                .map_err(|_| TcshapeError::invalid("percentage", value, "not a number"))?;
            (number, number / 100.0)
        }
        None => {
            let number = trimmed
                .parse::<f64>()
                .map_err(|_| TcshapeError::invalid("percentage", value, "not a number"))?;
            (number, number)
        }
    };

    if !number.is_finite() || !(0.0..=1.0).contains(&fraction) {
        return Err(TcshapeError::invalid(
            "percentage",
            value,
            "must be between 0% and 100%",
        ));
    }

    Ok(round_fraction(fraction))
}

/// Parse a bandwidth into bits per second.
///
/// Accepts the tcconfig-style `Kbps`/`Mbps` spellings as well as the
/// `Kbit`/`Mbit` spellings printed by tc. Both mean bits.
pub fn parse_rate_bps(value: &str) -> TcshapeResult<u64> {
    let (number, unit) =
        split_number(value).ok_or_else(|| TcshapeError::invalid("rate", value, "not a number"))?;
    if number < 0.0 {
        return Err(TcshapeError::invalid("rate", value, "must not be negative"));
    }

    let unit_lower = unit.to_ascii_lowercase();
    let base = unit_lower
        .strip_suffix("bps")
        .or_else(|| unit_lower.strip_suffix("bit"))
        .unwrap_or(unit_lower.as_str());

    let multiplier: f64 = match base {
        "" => 1.0,
        "k" => 1e3,
        "m" => 1e6,
        "g" => 1e9,
        "t" => 1e12,
        "ki" => 1024.0,
        "mi" => 1024.0 * 1024.0,
        "gi" => 1024.0 * 1024.0 * 1024.0,
        "ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => {
            return Err(TcshapeError::invalid(
                "rate",
                value,
                format!("unknown rate unit '{}'", unit),
            ));
        }
    };

    Ok((number * multiplier).round() as u64)
}

/// Render a bit rate the way tc accepts it (`100Kbit`, `1.5Mbit`).
pub fn format_rate(bps: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1_000_000_000_000, "Tbit"),
        (1_000_000_000, "Gbit"),
        (1_000_000, "Mbit"),
        (1_000, "Kbit"),
    ];
    for (scale, suffix) in UNITS {
        if bps >= scale {
            return format!("{}{}", trim_float(bps as f64 / scale as f64), suffix);
        }
    }
    format!("{}bit", bps)
}

/// Render milliseconds for tc (`100ms`, `0.5ms`).
pub fn format_ms(ms: f64) -> String {
    format!("{}ms", trim_float(ms))
}

/// Render a fraction of one as a tc percentage (`0.1` → `10%`).
pub fn format_percent(fraction: f64) -> String {
    format!("{}%", trim_float(round_fraction(fraction * 100.0)))
}

fn trim_float(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        format!("{}", rounded)
    }
}

fn round_ms(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn round_fraction(value: f64) -> f64 {
    (value * 1e9).round() / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_units_normalize_to_ms() {
        assert_eq!(parse_time_ms("100ms").unwrap(), 100.0);
        assert_eq!(parse_time_ms("0.1s").unwrap(), 100.0);
        assert_eq!(parse_time_ms("100").unwrap(), 100.0);
        assert_eq!(parse_time_ms("500us").unwrap(), 0.5);
        assert_eq!(parse_time_ms("2.95s").unwrap(), 2950.0);
        assert_eq!(parse_time_ms("1min").unwrap(), 60_000.0);
    }

    #[test]
    fn test_time_rejects_garbage() {
        assert!(parse_time_ms("fast").is_err());
        assert!(parse_time_ms("10parsecs").is_err());
        assert!(parse_time_ms("-5ms").is_err());
        assert!(parse_time_ms("").is_err());
    }

    #[test]
    fn test_percentages_with_and_without_sign() {
        assert_eq!(parse_fraction("10%").unwrap(), 0.1);
        assert_eq!(parse_fraction("0.1").unwrap(), 0.1);
        assert_eq!(parse_fraction("10%").unwrap(), parse_fraction("0.1").unwrap());
        assert_eq!(parse_fraction("0.5%").unwrap(), 0.005);
        assert_eq!(parse_fraction("100%").unwrap(), 1.0);
        assert_eq!(parse_fraction("0").unwrap(), 0.0);
    }

    #[test]
    fn test_percentages_out_of_range() {
        assert!(parse_fraction("150%").is_err());
        assert!(parse_fraction("10").is_err());
        assert!(parse_fraction("-1%").is_err());
        assert!(parse_fraction("abc%").is_err());
    }

    #[test]
    fn test_rate_units() {
        assert_eq!(parse_rate_bps("100Kbps").unwrap(), 100_000);
        assert_eq!(parse_rate_bps("100Kbit").unwrap(), 100_000);
        assert_eq!(parse_rate_bps("100kbit").unwrap(), 100_000);
        assert_eq!(parse_rate_bps("0.5Mbps").unwrap(), 500_000);
        assert_eq!(parse_rate_bps("32Gbit").unwrap(), IPROUTE2_UPPER_LIMIT_BPS);
        assert_eq!(parse_rate_bps("8bit").unwrap(), 8);
        assert_eq!(parse_rate_bps("1Kibps").unwrap(), 1024);
        assert_eq!(parse_rate_bps("1M").unwrap(), 1_000_000);
        assert!(parse_rate_bps("1Xbps").is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_rate(100_000), "100Kbit");
        assert_eq!(format_rate(1_500_000), "1.5Mbit");
        assert_eq!(format_rate(999), "999bit");
        assert_eq!(format_ms(100.0), "100ms");
        assert_eq!(format_ms(0.5), "0.5ms");
        assert_eq!(format_percent(0.1), "10%");
        assert_eq!(format_percent(0.005), "0.5%");
    }
}
