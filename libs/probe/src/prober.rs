//! The HTTP probe itself.
//!
//! Each phase is driven by hand (resolve, dial, TLS, HTTP/1.1 exchange) so
//! its boundaries can be stamped on a [`TraceRecorder`]:
//!
//! ```text
//! start ─ dns ─┬─ connect ─┬─ tls ─┬─ request ... first byte ─ body ─ complete
//!              │           │       │              │                     │
//!           DnsDone   ConnectDone TlsDone     FirstByte              Complete
//! ```

use crate::recorder::{TraceEvent, TraceRecorder};
use crate::{ProbeError, ProbeFailure, SetupError, Target, TraceResult};
use async_trait::async_trait;
use http::header::{CACHE_CONTROL, EXPIRES, HOST, USER_AGENT};
use http::{Method, Request};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const PROBE_USER_AGENT: &str = concat!("beacon-probe/", env!("CARGO_PKG_VERSION"));

/// Something that can trace a target URL.
#[async_trait]
pub trait Tracer: Send + Sync {
    async fn trace(&self, target: &str) -> Result<TraceResult, ProbeError>;
}

/// Issues one timed GET per call. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct Prober {
    timeout: Duration,
    tls: TlsConnector,
}

impl Prober {
    /// Trusts the Mozilla root set from `webpki-roots`.
    pub fn new(timeout: Duration) -> Result<Self, SetupError> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Self::with_roots(timeout, roots)
    }

    /// Trusts only `roots`, e.g. a private CA.
    pub fn with_roots(timeout: Duration, roots: RootCertStore) -> Result<Self, SetupError> {
        Ok(Self {
            timeout,
            tls: tls_connector(roots)?,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Trace `target`, giving up after the configured timeout.
    #[instrument(skip(self), fields(timeout_ms = self.timeout.as_millis() as u64))]
    pub async fn probe(&self, target: &str) -> Result<TraceResult, ProbeError> {
        let target = Target::parse(target).map_err(|e| ProbeError::new(target.trim(), e.into()))?;
        let mut recorder = TraceRecorder::start();

        let outcome = tokio::time::timeout(self.timeout, self.exchange(&target, &mut recorder)).await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(failure)) => return Err(ProbeError::new(target.into_string(), failure)),
            Err(_) => {
                return Err(ProbeError::new(
                    target.into_string(),
                    ProbeFailure::Timeout(self.timeout),
                ))
            }
        };

        let metrics = recorder.metrics();
        debug!(status, ?metrics, "Probe finished");

        Ok(TraceResult {
            url: target.into_string(),
            status,
            metrics,
        })
    }

    async fn exchange(
        &self,
        target: &Target,
        recorder: &mut TraceRecorder,
    ) -> Result<u16, ProbeFailure> {
        let addrs = resolve(target, recorder).await?;

        recorder.record(TraceEvent::ConnectStart);
        let tcp = connect_any(&addrs).await;
        recorder.record(TraceEvent::ConnectDone);
        let tcp = tcp?;
        let _ = tcp.set_nodelay(true);

        if !target.is_secure() {
            return send(target, tcp, recorder).await;
        }

        let server_name = ServerName::try_from(target.host().to_string())
            .map_err(|e| ProbeFailure::Tls(e.to_string()))?;

        recorder.record(TraceEvent::TlsStart);
        let tls = self.tls.connect(server_name, tcp).await;
        recorder.record(TraceEvent::TlsDone);
        let tls = tls.map_err(|e| ProbeFailure::Tls(e.to_string()))?;

        send(target, tls, recorder).await
    }
}

#[async_trait]
impl Tracer for Prober {
    async fn trace(&self, target: &str) -> Result<TraceResult, ProbeError> {
        self.probe(target).await
    }
}

fn tls_connector(roots: RootCertStore) -> Result<TlsConnector, SetupError> {
    let mut config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// IP literals skip the lookup, leaving the DNS phase at zero.
async fn resolve(
    target: &Target,
    recorder: &mut TraceRecorder,
) -> Result<Vec<SocketAddr>, ProbeFailure> {
    let port = target.port();
    if let Ok(ip) = target.host().parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    recorder.record(TraceEvent::DnsStart);
    let lookup = tokio::net::lookup_host((target.host(), port)).await;
    recorder.record(TraceEvent::DnsDone);

    let addrs: Vec<SocketAddr> = lookup
        .map_err(|e| ProbeFailure::Dns(e.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(ProbeFailure::Dns(format!("no addresses for {}", target.host())));
    }
    Ok(addrs)
}

async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream, ProbeFailure> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(ProbeFailure::Connect(
        last_error.map_or_else(|| "no addresses".to_string(), |e| e.to_string()),
    ))
}

async fn send<S>(
    target: &Target,
    stream: S,
    recorder: &mut TraceRecorder,
) -> Result<u16, ProbeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(http_failure)?;

    let request = Request::builder()
        .method(Method::GET)
        .uri(target.path_and_query())
        .header(HOST, target.host_header())
        .header(USER_AGENT, PROBE_USER_AGENT)
        .header(EXPIRES, "0")
        .header(CACHE_CONTROL, "no-cache")
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProbeFailure::Http(e.to_string()))?;

    let exchange = async {
        let response = sender.send_request(request).await?;
        recorder.record(TraceEvent::FirstByte);

        let status = response.status().as_u16();

        // Frames are dropped as they arrive; only the timing matters.
        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            frame?;
        }
        recorder.record(TraceEvent::Complete);

        Ok::<u16, hyper::Error>(status)
    };
    tokio::pin!(exchange);
    tokio::pin!(connection);

    let result = tokio::select! {
        biased;
        result = &mut exchange => result,
        closed = &mut connection => match closed {
            Err(e) => return Err(http_failure(e)),
            Ok(()) => exchange.await,
        },
    };

    result.map_err(http_failure)
}

fn http_failure(error: hyper::Error) -> ProbeFailure {
    ProbeFailure::Http(error.to_string())
}
