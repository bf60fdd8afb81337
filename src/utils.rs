use std::time::Duration;

/// Joins a base URL with path segments, normalizing slashes between them.
pub fn join_url(base: &str, paths: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_owned();

    for path in paths {
        let segment = path.trim_matches('/');
        if segment.is_empty() {
            continue;
        }

        url.push('/');
        url.push_str(segment);
    }

    url
}

/// Lexically normalizes a path: collapses repeated separators, resolves `.`
/// and `..` segments, and strips any trailing separator.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if let Some(last) = parts.last() {
                    if *last != ".." {
                        parts.pop();
                        continue;
                    }
                }

                if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}

/// Returns the parent directory of a path, mirroring `path.Dir` semantics on
/// the forward-slash paths used throughout the config surface.
pub fn dir_name(path: &str) -> String {
    let cleaned = clean_path(path);
    match cleaned.rfind('/') {
        Some(0) => "/".to_owned(),
        Some(idx) => cleaned[..idx].to_owned(),
        None => ".".to_owned(),
    }
}

/// Parses Go-style duration strings such as `45s`, `10m`, `1h30m` or `250ms`.
/// A bare integer is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_owned());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut value = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            value.push(c);
            continue;
        }

        let mut unit = String::from(c);
        if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            unit.push('s');
        }

        let n: u64 = value
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        value.clear();

        total += match unit.as_str() {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n * 60),
            "h" => Duration::from_secs(n * 3600),
            _ => return Err(format!("unknown duration unit {unit:?} in {input:?}")),
        };
    }

    if !value.is_empty() {
        return Err(format!("missing unit in duration {input:?}"));
    }

    Ok(total)
}

/// serde adapter for duration config fields expressed as `10m`-style strings
/// or plain integer seconds.
pub mod duration_str {
    use super::parse_duration;
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;
    use std::time::Duration;

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration string such as \"10m\" or integer seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse_duration(v).map_err(de::Error::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| de::Error::custom("duration must not be negative"))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        d.deserialize_any(DurationVisitor)
    }
}
