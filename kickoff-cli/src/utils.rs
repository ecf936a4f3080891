//! Shared helpers for the command-line surface.

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};

/// Parse a `host[:port]` connection string, filling in the default port.
pub fn parse_server_addr(addr: &str, default_port: u16) -> Result<String> {
    let mut parts = addr.split(':');
    let host = match parts.next() {
        Some(host) if !host.is_empty() => host,
        _ => bail!("server address has no host: \"{addr}\""),
    };

    let port = match parts.next() {
        Some(port_str) => match port_str.parse::<u16>() {
            Ok(port) => port,
            Err(_) => bail!("invalid port in server address: \"{addr}\""),
        },
        None => default_port,
    };

    if parts.next().is_some() {
        bail!("too many colons in server address: \"{addr}\"");
    }

    Ok(format!("{host}:{port}"))
}

/// Split a tag list on spaces, commas, and semicolons, dropping empties.
pub fn parse_resource_tags(list: &str) -> Vec<String> {
    list.split([' ', ',', ';'])
        .filter(|tag| !tag.is_empty())
        .map(|tag| tag.to_string())
        .collect()
}

/// Format a Unix timestamp (seconds) for humans.
pub fn format_timestamp_secs(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "invalid".to_string())
}

/// Format an elapsed interval as `1d2h3m4s`, omitting leading zero units.
pub fn format_interval(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let seconds = total_seconds % 60;
    let minutes = (total_seconds / 60) % 60;
    let hours = (total_seconds / 3600) % 24;
    let days = total_seconds / 86_400;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d"));
    }
    if hours > 0 || !out.is_empty() {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 || !out.is_empty() {
        out.push_str(&format!("{minutes}m"));
    }
    out.push_str(&format!("{seconds}s"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_addr_with_and_without_port() {
        assert_eq!(
            parse_server_addr("dispatch.example.com", 3355).unwrap(),
            "dispatch.example.com:3355"
        );
        assert_eq!(
            parse_server_addr("10.0.0.7:4000", 3355).unwrap(),
            "10.0.0.7:4000"
        );
    }

    #[test]
    fn server_addr_rejects_garbage() {
        assert!(parse_server_addr("", 3355).is_err());
        assert!(parse_server_addr(":3355", 3355).is_err());
        assert!(parse_server_addr("host:port", 3355).is_err());
        assert!(parse_server_addr("a:1:2", 3355).is_err());
    }

    #[test]
    fn tag_lists_split_on_all_separators() {
        assert_eq!(
            parse_resource_tags("cuda, amd64;linux fast"),
            vec!["cuda", "amd64", "linux", "fast"]
        );
        assert!(parse_resource_tags("").is_empty());
        assert!(parse_resource_tags(" ,; ").is_empty());
    }

    #[test]
    fn intervals_read_naturally() {
        assert_eq!(format_interval(4), "4s");
        assert_eq!(format_interval(64), "1m4s");
        assert_eq!(format_interval(3600), "1h0m0s");
        assert_eq!(format_interval(90_061), "1d1h1m1s");
        assert_eq!(format_interval(-5), "0s");
    }
}
