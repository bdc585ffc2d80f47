use crate::types::{MalformedKind, ParseConfig, Site, Strictness};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record at line {line}: {kind}")]
pub struct MalformedRecord {
    pub line: usize,
    pub kind: MalformedKind,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read ranked list: {0}")]
    Input(#[from] io::Error),
    #[error(transparent)]
    Malformed(#[from] MalformedRecord),
    #[error("Limit must be a positive integer, got {0}")]
    InvalidArgument(usize),
}

#[derive(Debug, Clone, Default)]
pub struct ParsedList {
    pub sites: Vec<Site>,
    pub skipped: Vec<MalformedRecord>,
}

impl ParsedList {
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Parses one record into a site with the given rank.
pub fn parse_record(line: &str, rank: usize) -> Result<Site, MalformedKind> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let path = line
        .split('\t')
        .nth(1)
        .ok_or(MalformedKind::MissingField)?;
    Site::from_path(path, rank)
}

/// Reads ranked records until `config.limit` sites have been accepted or the
/// source is exhausted. Ranks are assigned to accepted records only.
pub fn parse<R: BufRead>(mut source: R, config: &ParseConfig) -> Result<ParsedList, ParseError> {
    if config.limit == 0 {
        return Err(ParseError::InvalidArgument(config.limit));
    }

    let mut parsed = ParsedList::default();
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    while parsed.sites.len() < config.limit {
        buf.clear();
        if source.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        let rank = parsed.sites.len() + 1;

        let outcome = match std::str::from_utf8(&buf) {
            Ok(line) => parse_record(line.strip_suffix('\n').unwrap_or(line), rank),
            Err(_) => Err(MalformedKind::InvalidUtf8),
        };

        match outcome {
            Ok(site) => parsed.sites.push(site),
            Err(kind) => {
                let record = MalformedRecord { line: line_no, kind };
                if config.strictness == Strictness::Abort {
                    return Err(record.into());
                }
                warn!(line = line_no, "skipping {}", record);
                parsed.skipped.push(record);
            }
        }
    }

    debug!(
        sites = parsed.sites.len(),
        skipped = parsed.skipped.len(),
        "parsed ranked list"
    );
    Ok(parsed)
}

pub fn parse_file(path: impl AsRef<Path>, config: &ParseConfig) -> Result<ParsedList, ParseError> {
    let file = File::open(path.as_ref())?;
    parse(BufReader::new(file), config)
}
