use crate::{
    http::create_http_pool,
    ratelimit::HostRateLimiters,
    types::{ProbeConfig, ProbeError, ProbeErrorKind, ProbeMeasurement, ProbeResult, Site},
};
use futures::{
    future::Future,
    stream::{self, Stream, StreamExt},
};
use reqwest::Client;
use std::{
    error::Error as StdError,
    io,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Measures a single site. Implementations must not retry.
pub trait DomainProber: Send + Sync {
    fn probe(
        &self,
        site: &Site,
    ) -> impl Future<Output = Result<ProbeMeasurement, ProbeError>> + Send;
}

/// Issues `GET https://<domain>` and reads the whole body.
#[derive(Clone)]
pub struct HttpsProber {
    client: Client,
}

impl HttpsProber {
    pub fn new(timeout: Duration, max_idle_per_host: usize) -> reqwest::Result<Self> {
        Ok(Self::with_client(create_http_pool(timeout, max_idle_per_host)?))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl DomainProber for HttpsProber {
    async fn probe(&self, site: &Site) -> Result<ProbeMeasurement, ProbeError> {
        let url = format!("https://{}", site.domain());
        let start = Instant::now();

        let mut response = self.client.get(&url).send().await.map_err(classify)?;
        let status = response.status().as_u16();

        let mut bytes_received = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            bytes_received += chunk.len() as u64;
        }

        Ok(ProbeMeasurement {
            latency: start.elapsed(),
            bytes_received,
            status,
        })
    }
}

fn classify(err: reqwest::Error) -> ProbeError {
    let mut chain: Vec<&(dyn StdError + 'static)> = Vec::new();
    let mut cur: Option<&(dyn StdError + 'static)> = Some(&err);
    while let Some(e) = cur {
        chain.push(e);
        cur = e.source();
    }

    let refused = chain.iter().any(|e| {
        e.downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::ConnectionRefused)
    });
    let tls = chain.iter().any(|e| {
        let msg = e.to_string().to_lowercase();
        msg.contains("certificate") || msg.contains("tls") || msg.contains("handshake")
    });

    let kind = if err.is_timeout() {
        ProbeErrorKind::Timeout
    } else if refused {
        ProbeErrorKind::ConnectionRefused
    } else if tls {
        ProbeErrorKind::Tls
    } else {
        ProbeErrorKind::Other
    };

    let cause = chain
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ");
    ProbeError::new(kind, cause)
}

/// Runs probes with bounded concurrency, a per-probe timeout and per-host
/// rate limiting.
pub struct Prober<P = HttpsProber> {
    prober: Arc<P>,
    rate_limiters: Arc<HostRateLimiters>,
    config: ProbeConfig,
}

impl Prober<HttpsProber> {
    pub fn with_config(config: ProbeConfig) -> reqwest::Result<Self> {
        let prober = HttpsProber::new(config.timeout, config.concurrency.max(1))?;
        Ok(Self::with_prober(prober, config))
    }
}

impl<P: DomainProber> Prober<P> {
    pub fn with_prober(prober: P, config: ProbeConfig) -> Self {
        Self {
            prober: Arc::new(prober),
            rate_limiters: Arc::new(HostRateLimiters::new(config.max_rate_per_host)),
            config,
        }
    }

    pub async fn probe_one(&self, site: &Site) -> ProbeResult {
        let start = Instant::now();

        self.rate_limiters.acquire(site.domain()).await;

        let outcome = match tokio::time::timeout(self.config.timeout, self.prober.probe(site)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProbeError::new(
                ProbeErrorKind::Timeout,
                format!("no response within {:?}", self.config.timeout),
            )),
        };

        match &outcome {
            Ok(m) => debug!(
                domain = site.domain(),
                rank = site.rank(),
                latency_ms = m.latency.as_millis() as u64,
                bytes = m.bytes_received,
                "probe finished"
            ),
            Err(e) => warn!(domain = site.domain(), rank = site.rank(), "probe failed: {}", e),
        }

        ProbeResult {
            domain: site.domain().to_string(),
            rank: site.rank(),
            outcome,
            duration: start.elapsed(),
        }
    }

    /// Yields results in completion order, at most `concurrency` in flight.
    pub fn probe_stream<I>(&self, sites: I) -> impl Stream<Item = ProbeResult> + '_
    where
        I: IntoIterator<Item = Site>,
    {
        let sites: Vec<Site> = sites.into_iter().collect();

        stream::iter(sites)
            .map(move |site| async move { self.probe_one(&site).await })
            .buffer_unordered(self.config.concurrency.max(1))
    }

    /// Like [`probe_stream`](Self::probe_stream), but ends as soon as
    /// `shutdown` resolves. In-flight probes are dropped.
    pub fn probe_until<'a, I, F>(&'a self, sites: I, shutdown: F) -> impl Stream<Item = ProbeResult> + 'a
    where
        I: IntoIterator<Item = Site>,
        F: Future + 'a,
    {
        self.probe_stream(sites).take_until(shutdown)
    }
}

impl<P> Clone for Prober<P> {
    fn clone(&self) -> Self {
        Self {
            prober: Arc::clone(&self.prober),
            rate_limiters: Arc::clone(&self.rate_limiters),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProber {
        delay: Duration,
        hang_on: Option<&'static str>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeProber {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                hang_on: None,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl DomainProber for FakeProber {
        async fn probe(&self, site: &Site) -> Result<ProbeMeasurement, ProbeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = if self.hang_on == Some(site.domain()) {
                Duration::from_secs(3600)
            } else {
                self.delay
            };
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if site.domain().starts_with("refused.") {
                return Err(ProbeError::new(ProbeErrorKind::ConnectionRefused, "refused"));
            }
            Ok(ProbeMeasurement {
                latency: delay,
                bytes_received: site.rank() as u64 * 100,
                status: 200,
            })
        }
    }

    fn sites(n: usize) -> Vec<Site> {
        (1..=n)
            .map(|i| Site::from_path(&format!("site{i}.com/"), i).unwrap())
            .collect()
    }

    fn config(concurrency: usize) -> ProbeConfig {
        ProbeConfig {
            timeout: Duration::from_secs(5),
            concurrency,
            max_rate_per_host: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_one_reports_measurement() {
        let prober = Prober::with_prober(FakeProber::new(Duration::from_millis(20)), config(1));
        let site = Site::from_path("example.com/a", 3).unwrap();
        let result = prober.probe_one(&site).await;
        assert_eq!(result.domain, "example.com");
        assert_eq!(result.rank, 3);
        let measurement = result.outcome.unwrap();
        assert_eq!(measurement.bytes_received, 300);
        assert_eq!(measurement.status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_never_exceeds_concurrency() {
        let prober = Prober::with_prober(FakeProber::new(Duration::from_millis(50)), config(3));
        let results: Vec<_> = prober.probe_stream(sites(20)).collect().await;
        assert_eq!(results.len(), 20);
        assert!(results.iter().all(ProbeResult::is_ok));
        let peak = prober.prober.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency was {peak}");
        assert!(peak >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_host_times_out_without_stalling_batch() {
        let mut fake = FakeProber::new(Duration::from_millis(10));
        fake.hang_on = Some("site2.com");
        let prober = Prober::with_prober(fake, config(2));

        let results: Vec<_> = prober.probe_stream(sites(5)).collect().await;
        assert_eq!(results.len(), 5);

        let failed: Vec<_> = results.iter().filter(|r| !r.is_ok()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].domain, "site2.com");
        let err = failed[0].outcome.as_ref().unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failures_are_results_not_errors() {
        let prober = Prober::with_prober(FakeProber::new(Duration::from_millis(10)), config(4));
        let input = vec![
            Site::from_path("ok.com", 1).unwrap(),
            Site::from_path("refused.net", 2).unwrap(),
        ];
        let mut results: Vec<_> = prober.probe_stream(input).collect().await;
        results.sort_by_key(|r| r.rank);
        assert!(results[0].is_ok());
        let err = results[1].outcome.as_ref().unwrap_err();
        assert_eq!(err.kind, ProbeErrorKind::ConnectionRefused);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_remaining_probes() {
        let prober = Prober::with_prober(FakeProber::new(Duration::from_secs(1)), config(2));
        let shutdown = tokio::time::sleep(Duration::from_millis(1500));
        let results: Vec<_> = prober.probe_until(sites(10), shutdown).collect().await;
        assert!(!results.is_empty());
        assert!(results.len() < 10, "got {} results", results.len());
    }

    #[tokio::test(start_paused = true)]
    async fn clones_share_the_underlying_prober() {
        let prober = Prober::with_prober(FakeProber::new(Duration::from_millis(1)), config(1));
        let clone = prober.clone();
        clone.probe_one(&Site::from_path("a.com", 1).unwrap()).await;
        assert_eq!(prober.prober.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        let prober = HttpsProber::new(Duration::from_secs(5), 1).unwrap();
        let site = Site::from_path("127.0.0.1:1/", 1).unwrap();
        let err = prober.probe(&site).await.unwrap_err();
        assert_eq!(err.kind, ProbeErrorKind::ConnectionRefused, "cause: {}", err.cause);
    }

    #[tokio::test]
    async fn silent_server_is_classified_as_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let prober = HttpsProber::new(Duration::from_millis(100), 1).unwrap();
        let site = Site::from_path(&format!("{addr}/"), 1).unwrap();
        let err = prober.probe(&site).await.unwrap_err();
        assert_eq!(err.kind, ProbeErrorKind::Timeout, "cause: {}", err.cause);
    }
}
