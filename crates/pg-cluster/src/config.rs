//! Pool and cluster configuration.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;

/// Size limits of a single connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSettings {
    /// Connections opened at pool construction.
    pub min_size: usize,
    /// Upper bound on live connections.
    pub max_size: usize,
    /// Upper bound on callers waiting for a connection.
    pub max_queue_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 4,
            max_size: 15,
            max_queue_size: 200,
        }
    }
}

impl PoolSettings {
    /// Create settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of connections opened at construction.
    #[must_use]
    pub fn min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set the maximum number of live connections.
    #[must_use]
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the maximum number of waiting callers.
    #[must_use]
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Check the invariants of the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size > self.max_size {
            return Err(ConfigError::InvalidPoolSize {
                min: self.min_size,
                max: self.max_size,
            });
        }
        Ok(())
    }
}

/// Settings of a [`Cluster`](crate::Cluster).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterSettings {
    /// Settings applied to every host pool.
    pub pool: PoolSettings,
    /// Period between topology checks.
    pub topology_check_interval: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            topology_check_interval: Duration::from_secs(1),
        }
    }
}

impl ClusterSettings {
    /// Set the per-host pool settings.
    #[must_use]
    pub fn pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Set the topology check period.
    #[must_use]
    pub fn topology_check_interval(mut self, interval: Duration) -> Self {
        self.topology_check_interval = interval;
        self
    }
}

/// Hosts that make up a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterDescription {
    /// One connection string per host.
    pub dsns: Vec<Dsn>,
}

impl ClusterDescription {
    /// Create a description from a list of connection strings.
    pub fn new<I, S>(dsns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Dsn>,
    {
        Self {
            dsns: dsns.into_iter().map(Into::into).collect(),
        }
    }

    /// Check that the description names at least one non-empty host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dsns.is_empty() {
            return Err(ConfigError::EmptyCluster);
        }
        self.dsns.iter().try_for_each(Dsn::validate)
    }
}

/// PostgreSQL connection string.
///
/// Both the `key=value` form and the `postgresql://` URL form are accepted.
/// The [`Display`](fmt::Display) implementation never prints the password.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Dsn(String);

impl Dsn {
    /// Wrap a connection string.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self(dsn.into())
    }

    /// The full connection string, credentials included.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the connection string is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Reject empty connection strings and `key=value` strings that do not
    /// parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Err(ConfigError::EmptyDsn);
        }
        if url_body(self.0.trim()).is_none() {
            for pair in KeywordPairs::new(&self.0) {
                pair?;
            }
        }
        Ok(())
    }

    /// Connection string with the password removed.
    ///
    /// In the `key=value` form everything after a parse error is dropped,
    /// so a malformed value never reaches the output.
    #[must_use]
    pub fn cut_password(&self) -> String {
        let dsn = self.0.trim();
        if let Some(rest) = url_body(dsn) {
            let scheme = &dsn[..dsn.len() - rest.len()];
            return format!("{scheme}{}", cut_url_password(rest));
        }

        KeywordPairs::new(dsn)
            .map_while(Result::ok)
            .filter(|(key, _)| !is_password(key))
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn url_body(dsn: &str) -> Option<&str> {
    dsn.strip_prefix("postgresql://")
        .or_else(|| dsn.strip_prefix("postgres://"))
}

fn is_password(key: &str) -> bool {
    key.eq_ignore_ascii_case("password")
}

/// Iterator over the `key = value` pairs of a keyword connection string.
///
/// Follows libpq: whitespace is allowed around `=`, values may be
/// single-quoted, and a backslash escapes the next character. Values are
/// yielded as written, quotes and escapes included.
struct KeywordPairs<'a> {
    rest: &'a str,
    failed: bool,
}

impl<'a> KeywordPairs<'a> {
    fn new(dsn: &'a str) -> Self {
        Self {
            rest: dsn,
            failed: false,
        }
    }

    fn fail(&mut self, reason: String) -> Option<Result<(&'a str, &'a str), ConfigError>> {
        self.failed = true;
        Some(Err(ConfigError::InvalidDsn(reason)))
    }
}

impl<'a> Iterator for KeywordPairs<'a> {
    type Item = Result<(&'a str, &'a str), ConfigError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let input = self.rest.trim_start();
        if input.is_empty() {
            return None;
        }

        let key_end = input
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(input.len());
        let key = &input[..key_end];
        let after_key = input[key_end..].trim_start();
        let Some(after_eq) = after_key.strip_prefix('=') else {
            return self.fail("missing \"=\" after keyword".to_string());
        };
        if key.is_empty() {
            return self.fail("missing keyword before \"=\"".to_string());
        }

        let value_src = after_eq.trim_start();
        let quoted = value_src.starts_with('\'');
        let mut escaped = false;
        let mut value_end = None;
        for (index, c) in value_src.char_indices().skip(usize::from(quoted)) {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if quoted && c == '\'' {
                value_end = Some(index + 1);
                break;
            } else if !quoted && c.is_whitespace() {
                value_end = Some(index);
                break;
            }
        }
        let value_end = match value_end {
            Some(end) => end,
            None if quoted => {
                return self.fail(format!("unterminated quoted value of \"{key}\""));
            }
            None => value_src.len(),
        };

        self.rest = &value_src[value_end..];
        Some(Ok((key, &value_src[..value_end])))
    }
}

fn cut_url_password(rest: &str) -> String {
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    let authority = match authority.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
            format!("{user}@{host}")
        }
        None => authority.to_string(),
    };

    let Some((path, query)) = tail.split_once('?') else {
        return format!("{authority}{tail}");
    };
    let query = query
        .split('&')
        .filter(|param| {
            let key = param.split_once('=').map_or(*param, |(key, _)| key);
            !is_password(key)
        })
        .collect::<Vec<_>>()
        .join("&");
    if query.is_empty() {
        format!("{authority}{path}")
    } else {
        format!("{authority}{path}?{query}")
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cut_password())
    }
}

impl fmt::Debug for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dsn").field(&self.cut_password()).finish()
    }
}

impl From<&str> for Dsn {
    fn from(dsn: &str) -> Self {
        Self::new(dsn)
    }
}

impl From<String> for Dsn {
    fn from(dsn: String) -> Self {
        Self(dsn)
    }
}
