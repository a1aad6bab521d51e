use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::primitives::concurrency::host_name;

/// Who is touching the database; used only for attribution and diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// OS login name.
    pub user: String,
    /// Host name.
    pub host: String,
    /// Process id.
    pub pid: u32,
    /// Program name (`argv[0]` file name).
    pub program: String,
    /// Version of the program.
    pub version: String,
}

impl Identity {
    /// Identity of the running process.
    pub fn current() -> Self {
        let user = ["USER", "LOGNAME", "USERNAME"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| "unknown".to_string());
        let program = std::env::args_os()
            .next()
            .and_then(|arg0| {
                std::path::Path::new(&arg0)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        Self {
            user,
            host: sanitize_host(&host_name()),
            pid: std::process::id(),
            program,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Builds an identity by hand; tests use distinct pids to model
    /// different processes.
    pub fn new(user: &str, host: &str, pid: u32) -> Self {
        Self {
            user: user.to_string(),
            host: sanitize_host(host),
            pid,
            program: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.pid)
    }
}

/// Host names end up in file names; keep them to a portable character set.
fn sanitize_host(host: &str) -> String {
    let cleaned: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "localhost".to_string()
    } else {
        cleaned
    }
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Formats unix seconds as RFC 3339 (UTC).
pub fn format_unix(secs: u64) -> String {
    OffsetDateTime::from_unix_timestamp(secs as i64)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| secs.to_string())
}

/// Parses an RFC 3339 timestamp into unix seconds.
pub fn parse_rfc3339(text: &str) -> Option<u64> {
    OffsetDateTime::parse(text.trim(), &Rfc3339)
        .ok()
        .and_then(|t| u64::try_from(t.unix_timestamp()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_user_at_host_pid() {
        let id = Identity::new("ann", "lab box", 42);
        assert_eq!(id.to_string(), "ann@lab_box:42");
    }

    #[test]
    fn current_identity_has_pid() {
        let id = Identity::current();
        assert_eq!(id.pid, std::process::id());
        assert!(!id.host.is_empty());
    }

    #[test]
    fn rfc3339_roundtrip() {
        let text = format_unix(1_700_000_000);
        assert_eq!(text, "2023-11-14T22:13:20Z");
        assert_eq!(parse_rfc3339(&text), Some(1_700_000_000));
        assert_eq!(parse_rfc3339("yesterday"), None);
    }
}
