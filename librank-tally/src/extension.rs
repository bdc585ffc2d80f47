use crate::types::Site;
use serde::Serialize;
use std::{cmp::Ordering, collections::HashMap};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Invalid domain format: {0}")]
    InvalidDomain(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("Report length must be a positive integer, got {0}")]
    InvalidArgument(usize),
}

/// The lowercased final dot-delimited label of a domain.
pub fn extract_extension(domain: &str) -> Result<String, ExtensionError> {
    domain
        .rsplit('.')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| ExtensionError::InvalidDomain(domain.to_string()))
}

/// Tallies extensions of the sites it observes. Each instance owns its map.
#[derive(Debug, Default)]
pub struct ExtensionAggregator {
    counts: HashMap<String, u64>,
    total: u64,
}

impl ExtensionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, site: &Site) {
        // Site::from_path guarantees a non-empty final label.
        let ext = match extract_extension(site.domain()) {
            Ok(ext) => ext,
            Err(e) => {
                warn!(rank = site.rank(), "not counting site: {}", e);
                return;
            }
        };
        *self.counts.entry(ext).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn finish(self) -> ExtensionCounts {
        ExtensionCounts {
            counts: self.counts,
            total: self.total,
        }
    }
}

pub fn aggregate(sites: &[Site]) -> ExtensionCounts {
    let mut aggregator = ExtensionAggregator::new();
    for site in sites {
        aggregator.observe(site);
    }
    aggregator.finish()
}

/// Finished, read-only extension tally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionCounts {
    counts: HashMap<String, u64>,
    total: u64,
}

impl ExtensionCounts {
    pub fn get(&self, extension: &str) -> Option<u64> {
        self.counts.get(&extension.to_lowercase()).copied()
    }

    /// Number of sites that were aggregated, equal to the sum of all counts.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(ext, count)| (ext.as_str(), *count))
    }

    pub fn top_n(&self, n: usize) -> Result<Vec<RankedExtension>, ReportError> {
        top_n(self, n)
    }
}

/// Denominator used for report percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PercentBasis {
    /// Number of sites actually aggregated.
    #[default]
    Considered,
    /// A fixed denominator, typically the configured limit.
    Limit(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedExtension {
    pub position: usize,
    pub extension: String,
    pub count: u64,
    pub percentage: f64,
}

pub fn top_n(counts: &ExtensionCounts, n: usize) -> Result<Vec<RankedExtension>, ReportError> {
    top_n_with_basis(counts, n, PercentBasis::Considered)
}

/// Ranks extensions by count descending, breaking ties by extension name.
pub fn top_n_with_basis(
    counts: &ExtensionCounts,
    n: usize,
    basis: PercentBasis,
) -> Result<Vec<RankedExtension>, ReportError> {
    if n == 0 {
        return Err(ReportError::InvalidArgument(n));
    }

    let denominator = match basis {
        PercentBasis::Considered => counts.total,
        PercentBasis::Limit(limit) => limit,
    };

    let mut entries: Vec<(&str, u64)> = counts.iter().collect();
    entries.sort_by(|a, b| match b.1.cmp(&a.1) {
        Ordering::Equal => a.0.cmp(b.0),
        other => other,
    });

    Ok(entries
        .into_iter()
        .take(n)
        .enumerate()
        .map(|(idx, (ext, count))| RankedExtension {
            position: idx + 1,
            extension: ext.to_string(),
            count,
            percentage: percentage(count, denominator),
        })
        .collect())
}

fn percentage(count: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let raw = count as f64 / denominator as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites(domains: &[&str]) -> Vec<Site> {
        domains
            .iter()
            .enumerate()
            .map(|(i, d)| Site::from_path(d, i + 1).unwrap())
            .collect()
    }

    #[test]
    fn extract_extension_lowercases_final_label() {
        assert_eq!(extract_extension("Example.COM").unwrap(), "com");
        assert_eq!(extract_extension("bbc.co.uk").unwrap(), "uk");
        assert_eq!(extract_extension("localhost").unwrap(), "localhost");
        assert!(extract_extension("example.").is_err());
    }

    #[test]
    fn counts_sum_to_number_of_sites() {
        let counts = aggregate(&sites(&["a.com", "b.org/x", "c.COM", "d.net", "e.com"]));
        assert_eq!(counts.get("com"), Some(3));
        assert_eq!(counts.get("org"), Some(1));
        assert_eq!(counts.get("net"), Some(1));
        assert_eq!(counts.get("io"), None);
        assert_eq!(counts.total(), 5);
        assert_eq!(counts.iter().map(|(_, c)| c).sum::<u64>(), counts.total());
    }

    #[test]
    fn unusual_domains_are_all_counted() {
        let input = sites(&["LOCALHOST", "127.0.0.1:8080/x", "xn--p1ai", "a.b.c.Org"]);
        let counts = aggregate(&input);
        assert_eq!(counts.total(), input.len() as u64);
        assert_eq!(counts.get("localhost"), Some(1));
        assert_eq!(counts.get("1:8080"), Some(1));
        assert_eq!(counts.get("org"), Some(1));
    }

    #[test]
    fn aggregating_twice_is_identical() {
        let input = sites(&["a.com", "b.org", "c.de", "d.com"]);
        assert_eq!(aggregate(&input), aggregate(&input));
    }

    #[test]
    fn ties_are_broken_alphabetically() {
        let counts = aggregate(&sites(&["a.org", "b.net", "c.com", "d.net", "e.com", "f.io"]));
        let report = counts.top_n(10).unwrap();
        let order: Vec<_> = report.iter().map(|e| (e.extension.as_str(), e.count)).collect();
        assert_eq!(order, vec![("com", 2), ("net", 2), ("io", 1), ("org", 1)]);
        let positions: Vec<_> = report.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
    }

    #[test]
    fn report_is_truncated_to_n() {
        let counts = aggregate(&sites(&["a.org", "b.net", "c.com"]));
        assert_eq!(counts.top_n(2).unwrap().len(), 2);
        assert_eq!(counts.top_n(50).unwrap().len(), 3);
    }

    #[test]
    fn zero_length_report_is_rejected() {
        let counts = aggregate(&sites(&["a.org"]));
        assert_eq!(counts.top_n(0), Err(ReportError::InvalidArgument(0)));
    }

    #[test]
    fn empty_counts_give_empty_report() {
        let counts = aggregate(&[]);
        assert!(counts.is_empty());
        assert!(counts.top_n(5).unwrap().is_empty());
    }

    #[test]
    fn percentage_uses_considered_sites_by_default() {
        let counts = aggregate(&sites(&["a.com", "b.org", "c.com"]));
        let report = counts.top_n(1).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].extension, "com");
        assert!((report[0].percentage - 66.67).abs() < 1e-9);
    }

    #[test]
    fn limit_basis_divides_by_configured_limit() {
        let counts = aggregate(&sites(&["a.com", "b.org", "c.com"]));
        let report = top_n_with_basis(&counts, 2, PercentBasis::Limit(1000)).unwrap();
        assert!((report[0].percentage - 0.2).abs() < 1e-9);
        assert!((report[1].percentage - 0.1).abs() < 1e-9);
    }
}
