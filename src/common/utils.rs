//! Utility functions for metacoord

use crate::common::{Error, Result};
use rand::Rng;
use std::time::Duration;

/// Path separator of the hierarchical namespace
pub const SEPARATOR: char = '/';

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = match s.strip_suffix("ms") {
        Some(num) => (num, "ms"),
        None => s.split_at(s.len() - s.chars().last().map_or(0, char::len_utf8)),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => {
            return Err(Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Validate a store path: absolute, no empty, `.` or `..` segments, no trailing
/// separator, no control characters.
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with(SEPARATOR) {
        return Err(Error::invalid_path(path, "must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with(SEPARATOR) {
        return Err(Error::invalid_path(path, "must not end with '/'"));
    }
    if path.len() > 4096 {
        return Err(Error::invalid_path(path, "too long (max 4096 bytes)"));
    }
    if path.chars().any(|c| c.is_control()) {
        return Err(Error::invalid_path(path, "contains control characters"));
    }
    for segment in path[1..].split(SEPARATOR) {
        match segment {
            "" => return Err(Error::invalid_path(path, "empty segment")),
            "." | ".." => return Err(Error::invalid_path(path, "relative segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Reject paths whose first segment starts with a reserved prefix
pub fn check_reserved(path: &str, reserved: &[String]) -> Result<()> {
    let first = path.trim_start_matches(SEPARATOR).split(SEPARATOR).next();
    if let Some(first) = first.filter(|s| !s.is_empty()) {
        if let Some(prefix) = reserved.iter().find(|p| first.starts_with(p.as_str())) {
            return Err(Error::invalid_path(
                path,
                format!("namespace prefix '{}' is reserved", prefix),
            ));
        }
    }
    Ok(())
}

/// Parent of a validated path; `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a validated path
pub fn node_name(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}

/// Join a child name onto a path
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Retry with exponential backoff while `should_retry` accepts the error.
/// `max_retries` counts every attempt, including the first. Each sleep adds
/// up to 25% random jitter.
pub async fn retry_with_backoff<F, Fut, T, P>(
    mut f: F,
    should_retry: P,
    max_retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if should_retry(&e) && attempt + 1 < max_retries => {
                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                let wait = delay + Duration::from_millis(jitter);
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    wait
                );
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(max_delay);
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Internal("Max retries exceeded".into()))
}
