use serde::Serialize;
use std::{fmt, time::Duration};
use thiserror::Error;

/// One accepted entry of a ranked domain list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Site {
    name: String,
    domain: String,
    rank: usize,
}

impl Site {
    /// Builds a site from the path field of a record, deriving the domain
    /// from the text before the first `/`.
    pub fn from_path(name: &str, rank: usize) -> Result<Self, MalformedKind> {
        let domain = name.split('/').next().unwrap_or_default().trim();
        if domain.is_empty() {
            return Err(MalformedKind::EmptyDomain);
        }
        if domain.rsplit('.').next().map_or(true, str::is_empty) {
            return Err(MalformedKind::EmptyExtension);
        }

        Ok(Self {
            name: name.to_string(),
            domain: domain.to_string(),
            rank,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

/// Why a record was rejected by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    MissingField,
    EmptyDomain,
    EmptyExtension,
    InvalidUtf8,
}

impl fmt::Display for MalformedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedKind::MissingField => f.write_str("expected at least two tab-separated fields"),
            MalformedKind::EmptyDomain => f.write_str("empty domain"),
            MalformedKind::EmptyExtension => f.write_str("domain has an empty final label"),
            MalformedKind::InvalidUtf8 => f.write_str("record is not valid UTF-8"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Record the malformed line and keep reading.
    #[default]
    Skip,
    /// Fail on the first malformed line.
    Abort,
}

#[derive(Debug, Clone)]
pub struct ParseConfig {
    pub limit: usize,
    pub strictness: Strictness,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            limit: 1000,
            strictness: Strictness::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    Timeout,
    ConnectionRefused,
    Tls,
    Other,
}

impl fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::ConnectionRefused => "connection refused",
            ProbeErrorKind::Tls => "TLS error",
            ProbeErrorKind::Other => "request failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {cause}")]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub cause: String,
}

impl ProbeError {
    pub fn new(kind: ProbeErrorKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ProbeErrorKind::Timeout
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMeasurement {
    pub latency: Duration,
    pub bytes_received: u64,
    pub status: u16,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub domain: String,
    pub rank: usize,
    pub outcome: Result<ProbeMeasurement, ProbeError>,
    pub duration: Duration,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub timeout: Duration,
    pub concurrency: usize,
    pub max_rate_per_host: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            concurrency: 16,
            max_rate_per_host: 5,
        }
    }
}
