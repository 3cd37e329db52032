//! Human size strings (`512M`, `4G`, `1T`) used for RAM and disk sizes.

/// Parse a size into mebibytes. Accepts `M`, `G`, `T` with an optional
/// trailing `B`/`iB`, case-insensitive. A bare number is not accepted.
pub fn parse_size_mb(size: &str) -> Option<u64> {
    let lower = size.trim().to_lowercase();
    let lower = lower
        .strip_suffix("ib")
        .or_else(|| lower.strip_suffix('b'))
        .unwrap_or(&lower);

    let (digits, multiplier) = match lower.chars().last()? {
        'm' => (&lower[..lower.len() - 1], 1),
        'g' => (&lower[..lower.len() - 1], 1024),
        't' => (&lower[..lower.len() - 1], 1024 * 1024),
        _ => return None,
    };

    let value: u64 = digits.trim().parse().ok()?;
    if value == 0 {
        return None;
    }
    value.checked_mul(multiplier)
}

/// Render a byte count the way `qemu-img` and `du -h` do.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 4 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P'][exp];
    format!("{:.1} {}iB", bytes as f64 / div as f64, suffix)
}

/// Parse sizes as printed by `qemu-img snapshot -l` (`1.5 MiB`, `0 B`, `12K`).
pub fn parse_human_bytes(text: &str) -> Option<u64> {
    let compact: String = text.split_whitespace().collect();
    let lower = compact.to_lowercase();
    let lower = lower
        .strip_suffix("ib")
        .or_else(|| lower.strip_suffix('b'))
        .unwrap_or(&lower);

    let split = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (number, unit) = lower.split_at(split);
    let value: f64 = number.parse().ok()?;
    let scale = match unit {
        "" => 1u64,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        _ => return None,
    };
    Some((value * scale as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("512M", Some(512))]
    #[case("4G", Some(4096))]
    #[case("2gb", Some(2048))]
    #[case("1TiB", Some(1024 * 1024))]
    #[case("20", None)]
    #[case("0G", None)]
    #[case("G", None)]
    #[case("4X", None)]
    fn parses_sizes(#[case] input: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_size_mb(input), expected);
    }

    #[rstest]
    #[case(512, "512 B")]
    #[case(1536, "1.5 KiB")]
    #[case(3 * 1024 * 1024 * 1024, "3.0 GiB")]
    fn formats_bytes(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(format_bytes(bytes), expected);
    }

    #[rstest]
    #[case("0 B", Some(0))]
    #[case("1.5 MiB", Some(1572864))]
    #[case("12K", Some(12288))]
    #[case("lots", None)]
    fn parses_tool_sizes(#[case] input: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_human_bytes(input), expected);
    }
}
