//! Provides helpers to render and parse byte sizes.
//!
//! Cache capacities show up in two places: in log messages (eviction reports and the like),
//! where a value such as `17.2 MiB` is far easier on the eye than a raw byte count, and in the
//! system configuration, where settings like `max_memory: 64m` have to be turned back into
//! bytes.

/// The binary units a size can be rendered in, smallest first.
const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

/// Renders the given number of bytes in a human readable unit.
///
/// Sizes below one KiB are rendered as a plain byte count. Everything else is scaled into the
/// largest fitting unit of [UNITS] and rendered with roughly three significant digits.
///
/// # Examples
///
/// ```
/// assert_eq!(callisto::fmt::format_size(0), "0 bytes");
/// assert_eq!(callisto::fmt::format_size(1), "1 byte");
/// assert_eq!(callisto::fmt::format_size(100), "100 bytes");
/// assert_eq!(callisto::fmt::format_size(1024), "1.00 KiB");
/// assert_eq!(callisto::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(callisto::fmt::format_size(87_340), "85.3 KiB");
/// assert_eq!(callisto::fmt::format_size(873_400), "853 KiB");
/// assert_eq!(callisto::fmt::format_size(8_734_000), "8.33 MiB");
/// assert_eq!(callisto::fmt::format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    if size_in_bytes == 1 {
        return "1 byte".to_owned();
    }
    if size_in_bytes < 1024 {
        return format!("{} bytes", size_in_bytes);
    }

    let mut scaled = size_in_bytes as f64 / 1024.;
    let mut unit = 0;
    while scaled >= 1024. && unit + 1 < UNITS.len() {
        scaled /= 1024.;
        unit += 1;
    }

    // Keep roughly three significant digits...
    let decimals = if scaled < 10. {
        2
    } else if scaled < 100. {
        1
    } else {
        0
    };

    format!("{:.*} {}", decimals, scaled, UNITS[unit])
}

/// Parses a size in bytes from a setting like `512`, `64k` or `1 G`.
///
/// The value is a plain number of bytes, optionally followed by one of the (case insensitive)
/// units `b`, `k`, `m`, `g` or `t` which scale it by the matching power of 1024. Whitespace
/// around the number and the unit is ignored.
///
/// Returns an **Err** for anything else - most notably for negative or fractional numbers and
/// for unknown units.
///
/// # Examples
///
/// ```
/// assert_eq!(callisto::fmt::parse_size("100").unwrap(), 100);
/// assert_eq!(callisto::fmt::parse_size("100b").unwrap(), 100);
/// assert_eq!(callisto::fmt::parse_size("8k").unwrap(), 8192);
/// assert_eq!(callisto::fmt::parse_size("8m").unwrap(), 8 * 1024 * 1024);
/// assert_eq!(callisto::fmt::parse_size("4 G").unwrap(), 4 * 1024 * 1024 * 1024);
///
/// // An unknown unit results in an error...
/// assert_eq!(callisto::fmt::parse_size("3 Y").is_err(), true);
///
/// // Fractional numbers result in an error...
/// assert_eq!(callisto::fmt::parse_size("1.2g").is_err(), true);
///
/// // Negative numbers result in an error...
/// assert_eq!(callisto::fmt::parse_size("-1").is_err(), true);
/// ```
pub fn parse_size(input: impl AsRef<str>) -> anyhow::Result<usize> {
    let setting = input.as_ref().trim();

    // Everything up to the first non-digit is the number, the rest is the unit...
    let number_end = setting
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(setting.len());
    let (number, unit) = setting.split_at(number_end);

    let number = number.parse::<usize>().map_err(|_| {
        anyhow::anyhow!(
            "Cannot parse '{}' as a size: a positive number of bytes is required.",
            setting
        )
    })?;

    let factor: usize = match unit.trim() {
        "" | "b" | "B" => 1,
        "k" | "K" => 1 << 10,
        "m" | "M" => 1 << 20,
        "g" | "G" => 1 << 30,
        "t" | "T" => 1 << 40,
        other => {
            return Err(anyhow::anyhow!(
                "Cannot parse '{}' as a size: unknown unit '{}' (expected b, k, m, g or t).",
                setting,
                other
            ))
        }
    };

    Ok(number * factor)
}

#[cfg(test)]
mod tests {
    use crate::fmt::parse_size;

    #[test]
    fn whitespace_is_tolerated() {
        assert_eq!(parse_size("  8k ").unwrap(), 8192);
        assert_eq!(parse_size("8 k").unwrap(), 8192);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_size("").is_err(), true);
        assert_eq!(parse_size("k").is_err(), true);
        assert_eq!(parse_size("8 kb").is_err(), true);
        assert_eq!(parse_size("eight").is_err(), true);
    }
}
