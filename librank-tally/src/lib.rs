mod extension;
mod http;
mod parser;
mod prober;
mod ratelimit;
mod types;

pub use extension::{
    aggregate, extract_extension, top_n, top_n_with_basis, ExtensionAggregator, ExtensionCounts,
    ExtensionError, PercentBasis, RankedExtension, ReportError,
};
pub use parser::{parse, parse_file, parse_record, MalformedRecord, ParseError, ParsedList};
pub use prober::{DomainProber, HttpsProber, Prober};
pub use types::{
    MalformedKind, ParseConfig, ProbeConfig, ProbeError, ProbeErrorKind, ProbeMeasurement,
    ProbeResult, Site, Strictness,
};

