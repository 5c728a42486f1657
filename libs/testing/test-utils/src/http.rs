//! Local HTTP targets for probe tests.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Body served by `/`.
pub const TARGET_BODY: &str = "beacon test target";

/// Size of the body served by `/large`.
pub const LARGE_BODY_LEN: usize = 8 * 1024 * 1024;

/// How long `/slow` waits before answering.
pub const SLOW_RESPONSE: Duration = Duration::from_secs(10);

/// HTTP server on an ephemeral loopback port.
///
/// Routes:
/// - `/` returns 200 with [`TARGET_BODY`]
/// - `/status/{code}` returns the given status
/// - `/large` returns [`LARGE_BODY_LEN`] bytes
/// - `/slow` answers after [`SLOW_RESPONSE`]
///
/// The server task is aborted when this struct is dropped.
pub struct TestTarget {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    certificate: Option<CertificateDer<'static>>,
    handle: JoinHandle<()>,
}

impl TestTarget {
    /// Plain HTTP on `127.0.0.1`.
    pub async fn start() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = router(hits.clone());

        let listener = bind().await;
        let addr = listener.local_addr().expect("Failed to read local address");

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        tracing::debug!(%addr, "Test target listening");

        Self {
            addr,
            hits,
            certificate: None,
            handle,
        }
    }

    /// HTTPS with a fresh self-signed certificate for `localhost`.
    ///
    /// Clients must trust [`TestTarget::certificate`] and connect by the
    /// `localhost` name, as [`TestTarget::url`] does.
    pub async fn start_tls() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = router(hits.clone());

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .expect("Failed to generate certificate");
        let certificate = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("Failed to select TLS versions")
        .with_no_client_auth()
        .with_single_cert(vec![certificate.clone()], key)
        .expect("Failed to build TLS config");
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = bind().await;
        let addr = listener.local_addr().expect("Failed to read local address");

        let handle = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let service = TowerToHyperService::new(app.clone());
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service)
                        .await;
                });
            }
        });

        tracing::debug!(%addr, "TLS test target listening");

        Self {
            addr,
            hits,
            certificate: Some(certificate),
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Self-signed certificate of a [`TestTarget::start_tls`] target.
    pub fn certificate(&self) -> Option<&CertificateDer<'static>> {
        self.certificate.as_ref()
    }

    /// `http://127.0.0.1:<port><path>`, or `https://localhost:<port><path>`
    /// for a TLS target.
    pub fn url(&self, path: &str) -> String {
        match self.certificate {
            Some(_) => format!("https://localhost:{}{}", self.addr.port(), path),
            None => format!("http://{}{}", self.addr, path),
        }
    }

    /// Number of requests served so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for TestTarget {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn router(hits: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status/{code}", get(status))
        .route("/large", get(large))
        .route("/slow", get(slow))
        .with_state(hits)
}

async fn bind() -> TcpListener {
    TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test target")
}

/// URL of a loopback port nothing listens on.
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind probe port");
    let addr = listener.local_addr().expect("Failed to read local address");
    drop(listener);
    format!("http://{}/", addr)
}

async fn root(State(hits): State<Arc<AtomicUsize>>) -> &'static str {
    hits.fetch_add(1, Ordering::SeqCst);
    TARGET_BODY
}

async fn status(State(hits): State<Arc<AtomicUsize>>, Path(code): Path<u16>) -> StatusCode {
    hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn large(State(hits): State<Arc<AtomicUsize>>) -> Vec<u8> {
    hits.fetch_add(1, Ordering::SeqCst);
    vec![b'x'; LARGE_BODY_LEN]
}

async fn slow(State(hits): State<Arc<AtomicUsize>>) -> &'static str {
    hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(SLOW_RESPONSE).await;
    "late"
}
