//! Parsers for the text formats of the Linux virtual filesystem.

use thiserror::Error;

/// cgroups v1 reports "no limit" as the largest page-aligned signed 64-bit value. We treat
/// anything from here upwards as unlimited, which also covers kernels with larger pages.
const V1_UNLIMITED_THRESHOLD: u64 = 1 << 62;

#[derive(Debug, Error)]
pub(crate) enum ParseError {
    #[error("invalid memory mapping entry '{0}'")]
    InvalidMappingEntry(String),

    #[error("field '{0}' not found")]
    MissingField(&'static str),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unknown size unit in '{0}'")]
    UnknownUnit(String),
}

/// Finds a "Key:   value kB" line and returns the value in bytes.
pub(crate) fn parse_kib_field(contents: &str, field: &'static str) -> Result<u64, ParseError> {
    let value = contents
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == field).then_some(value)
        })
        .ok_or(ParseError::MissingField(field))?;

    let kib = value
        .split_whitespace()
        .next()
        .ok_or(ParseError::MissingField(field))?;

    Ok(parse_number::<u64>(kib)?.saturating_mul(1024))
}

/// Parses a cache size like `48K`, `2048K` or `32M` into bytes.
pub(crate) fn parse_cache_size(contents: &str) -> Result<u64, ParseError> {
    let trimmed = contents.trim();

    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((index, 'K')) => (trimmed.get(..index), 1024),
        Some((index, 'M')) => (trimmed.get(..index), 1024 * 1024),
        Some((index, 'G')) => (trimmed.get(..index), 1024 * 1024 * 1024),
        Some((_, c)) if c.is_ascii_digit() => (Some(trimmed), 1),
        _ => return Err(ParseError::UnknownUnit(trimmed.to_string())),
    };

    let digits = digits.ok_or_else(|| ParseError::UnknownUnit(trimmed.to_string()))?;

    Ok(parse_number::<u64>(digits)?.saturating_mul(multiplier))
}

/// The cgroups that the current process belongs to, relative to the cgroup filesystem root.
///
/// Paths are normalized to either be empty (the root) or start with `/` and have no trailing `/`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct CgroupPaths {
    pub(crate) v1_memory: Option<String>,
    pub(crate) v2: Option<String>,
}

/// Parses the contents of `/proc/self/cgroup`.
pub(crate) fn parse_cgroup_paths(contents: &str) -> CgroupPaths {
    let mut paths = CgroupPaths::default();

    for line in contents.lines() {
        let mut parts = line.splitn(3, ':');

        let (Some(_hierarchy), Some(controllers), Some(path)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        let path = path.trim().trim_end_matches('/').to_string();

        if controllers.is_empty() {
            paths.v2 = Some(path);
        } else if controllers.split(',').any(|controller| controller == "memory") {
            paths.v1_memory = Some(path);
        }
    }

    paths
}

/// Parses a cgroup memory limit file. Returns `None` if no limit is set.
pub(crate) fn parse_cgroup_memory_limit(contents: &str) -> Result<Option<u64>, ParseError> {
    let trimmed = contents.trim();

    if trimmed == "max" {
        return Ok(None);
    }

    let value = parse_number::<u64>(trimmed)?;

    if value >= V1_UNLIMITED_THRESHOLD {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}

/// Whether any mapping in `/proc/self/maps` that overlaps `start..end` is accessible.
pub(crate) fn is_any_mapping_accessible(
    maps: &str,
    start: usize,
    end: usize,
) -> Result<bool, ParseError> {
    for line in maps.lines() {
        let mut fields = line.split_whitespace();

        let (Some(range), Some(permissions)) = (fields.next(), fields.next()) else {
            continue;
        };

        let (mapping_start, mapping_end) = range
            .split_once('-')
            .ok_or_else(|| ParseError::InvalidMappingEntry(line.to_string()))?;

        let mapping_start = parse_hex(mapping_start)?;
        let mapping_end = parse_hex(mapping_end)?;

        let overlaps = mapping_start < end && start < mapping_end;

        if overlaps && !permissions.starts_with("---") {
            return Ok(true);
        }
    }

    Ok(false)
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Result<T, ParseError> {
    s.trim()
        .parse::<T>()
        .map_err(|_parse_error| ParseError::InvalidNumber(s.to_string()))
}

fn parse_hex(s: &str) -> Result<usize, ParseError> {
    usize::from_str_radix(s, 16).map_err(|_parse_error| ParseError::InvalidNumber(s.to_string()))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn kib_field_from_meminfo() {
        let meminfo = "MemTotal:       16318472 kB\n\
                       MemFree:         1234567 kB\n\
                       MemAvailable:    8000000 kB\n";

        assert_eq!(
            parse_kib_field(meminfo, "MemTotal").unwrap(),
            16_318_472 * 1024
        );
        assert_eq!(
            parse_kib_field(meminfo, "MemAvailable").unwrap(),
            8_000_000 * 1024
        );
        assert!(matches!(
            parse_kib_field(meminfo, "SwapFree"),
            Err(ParseError::MissingField("SwapFree"))
        ));
    }

    #[test]
    fn kib_field_does_not_match_prefix() {
        let status = "VmRSSx:   1 kB\nVmRSS:    2048 kB\n";

        assert_eq!(parse_kib_field(status, "VmRSS").unwrap(), 2048 * 1024);
    }

    #[test]
    fn cache_sizes() {
        assert_eq!(parse_cache_size("48K\n").unwrap(), 48 * 1024);
        assert_eq!(parse_cache_size("32M").unwrap(), 32 * 1024 * 1024);
        assert_eq!(parse_cache_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_cache_size("512").unwrap(), 512);
        parse_cache_size("12X").unwrap_err();
        parse_cache_size("").unwrap_err();
        parse_cache_size("K").unwrap_err();
    }

    #[test]
    fn cgroup_paths_v2_only() {
        let paths = parse_cgroup_paths("0::/user.slice/session-1.scope\n");

        assert_eq!(paths.v2.as_deref(), Some("/user.slice/session-1.scope"));
        assert_eq!(paths.v1_memory, None);
    }

    #[test]
    fn cgroup_paths_root_is_normalized_to_empty() {
        let paths = parse_cgroup_paths("0::/\n");

        assert_eq!(paths.v2.as_deref(), Some(""));
    }

    #[test]
    fn cgroup_paths_hybrid() {
        let paths = parse_cgroup_paths(
            "17:cpuset:/docker/abc\n\
             15:memory:/docker/abc\n\
             4:cpu,cpuacct:/docker/abc\n\
             0::/docker/abc\n",
        );

        assert_eq!(paths.v1_memory.as_deref(), Some("/docker/abc"));
        assert_eq!(paths.v2.as_deref(), Some("/docker/abc"));
    }

    #[test]
    fn cgroup_memory_limits() {
        assert_eq!(parse_cgroup_memory_limit("max\n").unwrap(), None);
        assert_eq!(
            parse_cgroup_memory_limit("104857600\n").unwrap(),
            Some(104_857_600)
        );
        assert_eq!(
            parse_cgroup_memory_limit("9223372036854771712").unwrap(),
            None
        );
        parse_cgroup_memory_limit("lots").unwrap_err();
    }

    #[test]
    fn mapping_accessibility() {
        let maps = "\
10000-20000 rw-p 00000000 00:00 0
20000-40000 ---p 00000000 00:00 0
40000-50000 r-xp 00000000 08:01 1234 /usr/lib/libc.so.6
";

        assert!(is_any_mapping_accessible(maps, 0x1_0000, 0x1_1000).unwrap());
        assert!(!is_any_mapping_accessible(maps, 0x2_0000, 0x4_0000).unwrap());
        assert!(is_any_mapping_accessible(maps, 0x3_f000, 0x4_1000).unwrap());
        assert!(!is_any_mapping_accessible(maps, 0x6_0000, 0x7_0000).unwrap());
    }
}
