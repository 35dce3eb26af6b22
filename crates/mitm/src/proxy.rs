//! The outer listener: HTTP CONNECT on a Unix-domain socket, TLS
//! termination with a CA-signed leaf, and lifecycle management.

use std::{collections::HashMap, path::PathBuf, pin::Pin, sync::Arc, task::Poll, time::Duration};

use {
    anyhow::{Context, Result, bail},
    hyper::body::Bytes,
    hyper_util::rt::TokioIo,
    rustls::ServerConfig,
    secrecy::SecretString,
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
        net::{UnixListener, UnixStream},
    },
    tokio_rustls::TlsAcceptor,
    tokio_util::{sync::CancellationToken, task::TaskTracker},
    tracing::{debug, info, warn},
};

use crate::{
    ca::CertificateAuthority,
    handler::InnerHandler,
    providers::{SentinelMap, default_providers},
    resolver::SniCertResolver,
};

/// Stalled TLS negotiations are cleaned up after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on the CONNECT header block.
const MAX_CONNECT_HEADER: usize = 8192;

pub struct MitmConfig {
    pub socket_path: PathBuf,
    pub ca_dir: PathBuf,
    /// Real provider keys, keyed by provider host.
    pub real_keys: HashMap<String, SecretString>,
}

pub struct MitmProxy {
    socket_path: PathBuf,
    sentinels: Arc<SentinelMap>,
    handler: Arc<InnerHandler>,
    tls_config: Arc<ServerConfig>,
    ca_cert_pem: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl MitmProxy {
    pub fn new(config: MitmConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let ca = Arc::new(CertificateAuthority::load_or_generate(&config.ca_dir)?);
        let ca_cert_pem = ca.cert_pem().to_string();

        let sentinels = Arc::new(SentinelMap::new(default_providers(), config.real_keys));

        // Warm leaves for every configured host so the first request skips
        // the generation latency.
        let resolver = Arc::new(SniCertResolver::new(ca));
        resolver.warm(&sentinels.hosts());

        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            socket_path: config.socket_path,
            handler: Arc::new(InnerHandler::new(Arc::clone(&sentinels))),
            sentinels,
            tls_config: Arc::new(tls_config),
            ca_cert_pem,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// The CA certificate to trust inside the sandbox (public material).
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Environment variables carrying the sentinels into the container.
    pub fn container_env(&self) -> HashMap<String, String> {
        self.sentinels.container_env()
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Bind the socket and start accepting. Returns once listening.
    pub async fn start(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("failed to remove stale socket {}", self.socket_path.display()))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        info!(socket = %self.socket_path.display(), "MITM proxy listening");

        let sentinels = Arc::clone(&self.sentinels);
        let handler = Arc::clone(&self.handler);
        let tls_config = Arc::clone(&self.tls_config);
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        },
                    },
                    _ = cancel.cancelled() => break,
                };

                let sentinels = Arc::clone(&sentinels);
                let handler = Arc::clone(&handler);
                let tls_config = Arc::clone(&tls_config);
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    if let Err(e) =
                        handle_connection(stream, sentinels, handler, tls_config, cancel).await
                    {
                        debug!(error = %e, "connection ended with error");
                    }
                });
            }
        });

        Ok(())
    }

    /// Cancel every live connection and upstream request, stop the
    /// listener, and unlink the socket file.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if let Err(e) = std::fs::remove_file(&self.socket_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(error = %e, "failed to unlink proxy socket");
        }
        info!("MITM proxy shut down");
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    sentinels: Arc<SentinelMap>,
    handler: Arc<InnerHandler>,
    tls_config: Arc<ServerConfig>,
    cancel: CancellationToken,
) -> Result<()> {
    let (host, leftover) = read_connect(&mut stream).await?;

    // Non-allowlisted hosts are rejected at the CONNECT stage; the TLS
    // handshake never happens.
    if sentinels.get(&host).is_none() {
        warn!(host = %host, "CONNECT to non-allowed host rejected");
        stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .await
            .ok();
        return Ok(());
    }

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    // Push back any bytes read past the CONNECT header before TLS starts.
    let rewound = Rewind {
        prefix: (!leftover.is_empty()).then_some(leftover),
        inner: stream,
    };

    let acceptor = TlsAcceptor::from(tls_config);
    let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(rewound))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

    debug!(host = %host, "TLS established, serving inner HTTP");

    let service = hyper::service::service_fn(move |req| {
        let handler = Arc::clone(&handler);
        let host = host.clone();
        async move {
            Ok::<_, std::convert::Infallible>(handler.handle(&host, req).await)
        }
    });

    let connection = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(tls_stream), service);
    tokio::select! {
        result = connection => result.context("inner HTTP connection failed"),
        // Session shutdown destroys the socket; in-flight upstream
        // requests are dropped with it.
        _ = cancel.cancelled() => Ok(()),
    }
}

/// Read the CONNECT header block, returning the target host and any bytes
/// already read past the header.
async fn read_connect(stream: &mut UnixStream) -> Result<(String, Bytes)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed before CONNECT completed");
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_header_end(&buf) {
            let head = std::str::from_utf8(&buf[..end]).context("non-UTF-8 CONNECT header")?;
            let host = parse_connect_line(head.lines().next().unwrap_or_default())?;
            let leftover = Bytes::copy_from_slice(&buf[end + 4..]);
            return Ok((host, leftover));
        }
        if buf.len() > MAX_CONNECT_HEADER {
            bail!("CONNECT header exceeds {MAX_CONNECT_HEADER} bytes");
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse `CONNECT host:port HTTP/1.1`, stripping the port.
fn parse_connect_line(line: &str) -> Result<String> {
    let mut parts = line.split_whitespace();
    if parts.next() != Some("CONNECT") {
        bail!("expected CONNECT, got: {line}");
    }
    let authority = parts.next().context("CONNECT line missing authority")?;
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    if host.is_empty() {
        bail!("CONNECT line has empty host");
    }
    Ok(host.to_ascii_lowercase())
}

/// Replays already-read bytes before handing the underlying stream to TLS.
struct Rewind<T> {
    prefix: Option<Bytes>,
    inner: T,
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            if n < prefix.len() {
                self.prefix = Some(prefix.slice(n..));
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
