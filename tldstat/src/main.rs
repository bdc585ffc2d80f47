use clap::Parser;
use futures::StreamExt;
use librank_tally::{
    aggregate, parse_file, top_n_with_basis, ParseConfig, PercentBasis, ProbeConfig,
    ProbeErrorKind, ProbeResult, Prober, RankedExtension, Site, Strictness,
};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_INPUT: &str = "top1m.txt";
const DEFAULT_TOP: usize = 1000;
const DEFAULT_EXTENSIONS: usize = 50;

type BoxError = Box<dyn std::error::Error>;

#[derive(Debug, Default, Deserialize, Serialize)]
struct Config {
    #[serde(default)]
    input: InputConfig,
    #[serde(default)]
    probe: ProbeSection,
    #[serde(default)]
    report: ReportConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct InputConfig {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    top: Option<usize>,
    #[serde(default)]
    strict: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ProbeSection {
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    max_rate_per_host: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ReportConfig {
    #[serde(default)]
    extensions: Option<usize>,
    #[serde(default)]
    percent_of_limit: bool,
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tldstat").join("config.toml"))
}

fn load_config() -> Config {
    config_path()
        .and_then(|path| std::fs::read_to_string(&path).ok())
        .and_then(|content| match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring invalid config file: {}", e);
                None
            }
        })
        .unwrap_or_default()
}

fn get_default_config_toml() -> String {
    r#"# tldstat configuration

[input]
# Ranked list to read: tab-separated, domain path in the second column
path = "top1m.txt"
# How many ranked entries to consider
top = 1000
# Abort on the first malformed record instead of skipping it
strict = false

[probe]
# Per-site deadline for the HTTPS request, including the body
timeout_secs = 10
# Probes in flight at once
concurrency = 16
# Request starts per second against the same host
max_rate_per_host = 5

[report]
# Length of the extension table
extensions = 50
# Divide by the configured `top` instead of the number of sites read
percent_of_limit = false
"#
    .to_string()
}

#[derive(Parser, Debug)]
#[command(name = "tldstat")]
#[command(about = "Tally TLDs of a ranked domain list and measure HTTPS latency", long_about = None)]
struct Args {
    /// Number of ranked entries to consider [default: 1000]
    #[arg(long)]
    top: Option<usize>,

    /// Ranked list to read [default: top1m.txt]
    #[arg(long, short = 'i')]
    input: Option<PathBuf>,

    /// Number of extensions in the report [default: 50]
    #[arg(long)]
    extensions: Option<usize>,

    /// Only tally extensions, do not probe any site
    #[arg(long)]
    skip_probe: bool,

    /// Abort on the first malformed record
    #[arg(long)]
    strict: bool,

    /// Per-site timeout in seconds [default: 10]
    #[arg(long)]
    timeout: Option<u64>,

    /// Maximum probes in flight [default: 16]
    #[arg(long)]
    concurrency: Option<usize>,

    /// Compute percentages against --top rather than the sites actually read
    #[arg(long)]
    percent_of_limit: bool,

    /// Output results as NDJSON stream (one JSON object per line)
    #[arg(long, short = 'j')]
    ndjson: bool,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Print the default config to stdout and exit
    #[arg(long)]
    print_default_config: bool,

    /// Write the default config to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

#[derive(Debug)]
struct Settings {
    input: PathBuf,
    parse: ParseConfig,
    probe: ProbeConfig,
    extensions: usize,
    basis: PercentBasis,
    skip_probe: bool,
    ndjson: bool,
}

impl Settings {
    /// Command line flags win over the config file, which wins over defaults.
    fn resolve(args: &Args, config: &Config) -> Result<Self, BoxError> {
        let top = args.top.or(config.input.top).unwrap_or(DEFAULT_TOP);
        if top == 0 {
            return Err("--top must be a positive integer".into());
        }
        let extensions = args
            .extensions
            .or(config.report.extensions)
            .unwrap_or(DEFAULT_EXTENSIONS);
        if extensions == 0 {
            return Err("--extensions must be a positive integer".into());
        }

        let defaults = ProbeConfig::default();
        let probe = ProbeConfig {
            timeout: args
                .timeout
                .or(config.probe.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            concurrency: args
                .concurrency
                .or(config.probe.concurrency)
                .unwrap_or(defaults.concurrency)
                .max(1),
            max_rate_per_host: config
                .probe
                .max_rate_per_host
                .unwrap_or(defaults.max_rate_per_host),
        };

        let strictness = if args.strict || config.input.strict {
            Strictness::Abort
        } else {
            Strictness::Skip
        };
        let basis = if args.percent_of_limit || config.report.percent_of_limit {
            PercentBasis::Limit(top as u64)
        } else {
            PercentBasis::Considered
        };

        Ok(Self {
            input: args
                .input
                .clone()
                .or_else(|| config.input.path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INPUT)),
            parse: ParseConfig {
                limit: top,
                strictness,
            },
            probe,
            extensions,
            basis,
            skip_probe: args.skip_probe,
            ndjson: args.ndjson,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Record {
    Probe(ProbeRecord),
    Extension(RankedExtension),
}

#[derive(Debug, Serialize)]
struct ProbeRecord {
    rank: usize,
    domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ProbeErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&ProbeResult> for ProbeRecord {
    fn from(result: &ProbeResult) -> Self {
        let mut record = ProbeRecord {
            rank: result.rank,
            domain: result.domain.clone(),
            latency_ms: None,
            bytes: None,
            status: None,
            error_kind: None,
            error: None,
        };
        match &result.outcome {
            Ok(m) => {
                record.latency_ms = Some(m.latency.as_secs_f64() * 1000.0);
                record.bytes = Some(m.bytes_received);
                record.status = Some(m.status);
            }
            Err(e) => {
                record.error_kind = Some(e.kind);
                record.error = Some(e.cause.clone());
            }
        }
        record
    }
}

fn write_probe_line<W: Write>(out: &mut W, result: &ProbeResult, ndjson: bool) -> io::Result<()> {
    if ndjson {
        let json = serde_json::to_string(&Record::Probe(ProbeRecord::from(result)))?;
        return writeln!(out, "{}", json);
    }
    match &result.outcome {
        Ok(m) => writeln!(
            out,
            "{:>6}. {:<40} {:>9.1} ms {:>10} bytes  HTTP {}",
            result.rank,
            result.domain,
            m.latency.as_secs_f64() * 1000.0,
            m.bytes_received,
            m.status
        ),
        Err(e) => writeln!(out, "{:>6}. {:<40} error: {}", result.rank, result.domain, e),
    }
}

fn write_report<W: Write>(
    out: &mut W,
    report: &[RankedExtension],
    considered: u64,
    ndjson: bool,
) -> io::Result<()> {
    if ndjson {
        for entry in report {
            let json = serde_json::to_string(&Record::Extension(entry.clone()))?;
            writeln!(out, "{}", json)?;
        }
        return Ok(());
    }

    writeln!(out)?;
    writeln!(out, "Top {} extensions of {} sites", report.len(), considered)?;
    for entry in report {
        writeln!(
            out,
            "{}.\t{}\t{}\t{:.2}",
            entry.position, entry.extension, entry.count, entry.percentage
        )?;
    }
    Ok(())
}

async fn run_probes(sites: &[Site], config: ProbeConfig, ndjson: bool) -> Result<(), BoxError> {
    let prober = Prober::with_config(config)?;
    let total = sites.len();

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler available; never cancel.
            std::future::pending::<()>().await;
        }
    };
    let mut stream = Box::pin(prober.probe_until(sites.iter().cloned(), shutdown));

    let mut done = 0usize;
    let mut failed = 0usize;
    let mut stdout = io::stdout();
    while let Some(result) = stream.next().await {
        done += 1;
        if !result.is_ok() {
            failed += 1;
        }
        write_probe_line(&mut stdout, &result, ndjson)?;
        stdout.flush()?;
    }

    if done < total {
        warn!("Probing interrupted after {} of {} sites", done, total);
    } else {
        info!("Probed {} sites, {} failed", total, failed);
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn write_default_config(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, get_default_config_toml())
}

fn run(args: Args) -> Result<(), BoxError> {
    let config = load_config();
    let settings = Settings::resolve(&args, &config)?;

    let parsed = parse_file(&settings.input, &settings.parse)
        .map_err(|e| format!("{}: {}", settings.input.display(), e))?;
    if !parsed.skipped.is_empty() {
        eprintln!(
            "Warning: skipped {} malformed record(s) in {}",
            parsed.skipped.len(),
            settings.input.display()
        );
    }

    // Tally before probing so an interrupted probe run still gets a report.
    let counts = aggregate(&parsed.sites);
    let report = top_n_with_basis(&counts, settings.extensions, settings.basis)?;

    if !settings.skip_probe && !parsed.is_empty() {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(run_probes(&parsed.sites, settings.probe.clone(), settings.ndjson))?;
    }

    let mut stdout = io::stdout();
    write_report(&mut stdout, &report, counts.total(), settings.ndjson)?;
    stdout.flush()?;
    Ok(())
}

fn main() {
    let args = Args::parse();

    if args.print_default_config {
        println!("{}", get_default_config_toml());
        return;
    }

    if args.write_default_config {
        match config_path() {
            Some(path) => match write_default_config(&path) {
                Ok(()) => println!("Default config written to: {}", path.display()),
                Err(e) => {
                    eprintln!("Error: Could not write {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            },
            None => {
                eprintln!("Error: Could not determine config path");
                std::process::exit(1);
            }
        }
        return;
    }

    init_logging(args.verbose);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
