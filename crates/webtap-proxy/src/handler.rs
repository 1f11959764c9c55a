//! Request router for one accepted proxy connection.
//!
//! `CONNECT` requests are answered here and then taken over through the
//! hyper upgrade: policy-matched hosts go to a MITM session, everything else
//! to a blind tunnel. Other methods are forwarded as plain HTTP without
//! inspection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1::Builder as ClientBuilder;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use webtap_core::ProtocolAdapter;

use crate::ca::CertificateAuthority;
use crate::dialer::UpstreamDialer;
use crate::domains::DomainPolicy;
use crate::sniff::SniffControl;
use crate::{mitm, tunnel};

/// Response body type used by the router.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Default port for CONNECT targets without one.
const DEFAULT_CONNECT_PORT: u16 = 443;

/// Default port for plain HTTP targets without one.
const DEFAULT_HTTP_PORT: u16 = 80;

/// Everything a connection handler needs, shared by all connections of one
/// proxy instance.
#[derive(Clone)]
pub struct ProxyState {
    /// Leaf issuer.
    pub ca: Arc<CertificateAuthority>,
    /// Sniff domains and upstream proxy.
    pub policy: Arc<DomainPolicy>,
    /// Adapter for this instance, `None` to intercept without recording.
    pub adapter: Option<Arc<dyn ProtocolAdapter>>,
    /// Sniffing switch and event queue.
    pub control: SniffControl,
    /// Client config for the origin leg of MITM sessions.
    pub upstream_tls: Arc<ClientConfig>,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("ca", &self.ca)
            .field("policy", &self.policy)
            .field("adapter", &self.adapter.as_ref().map(|a| a.name()))
            .field("control", &self.control)
            .finish()
    }
}

/// Serves one accepted client connection until it closes.
pub async fn serve_connection(state: Arc<ProxyState>, stream: TcpStream, peer: SocketAddr) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(route(state, peer, req).await) }
    });

    if let Err(e) = ServerBuilder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        tracing::debug!("connection from {} ended: {}", peer, e);
    }
}

async fn route(state: Arc<ProxyState>, peer: SocketAddr, req: Request<Incoming>) -> Response<ProxyBody> {
    tracing::debug!("{} {} from {}", req.method(), req.uri(), peer);

    if req.method() == Method::CONNECT {
        handle_connect(state, req).await
    } else {
        forward_http(state, req).await
    }
}

// =============================================================================
// CONNECT
// =============================================================================

async fn handle_connect(state: Arc<ProxyState>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return status(StatusCode::BAD_REQUEST);
    };
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = authority.port_u16().unwrap_or(DEFAULT_CONNECT_PORT);

    let dialer = match state.policy.dialer() {
        Ok(dialer) => dialer,
        Err(e) => {
            tracing::warn!("upstream proxy unusable: {}", e);
            return status(StatusCode::BAD_GATEWAY);
        }
    };

    if state.policy.is_sniff_domain(&host) {
        intercept(state, req, dialer, host, port).await
    } else {
        passthrough(req, dialer, host, port).await
    }
}

async fn intercept(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    dialer: UpstreamDialer,
    host: String,
    port: u16,
) -> Response<ProxyBody> {
    tracing::debug!("intercepting {}:{}", host, port);

    let leaf = match state.ca.leaf(&host).await {
        Ok(leaf) => leaf,
        Err(e) => {
            tracing::warn!("failed to issue certificate for {}: {}", host, e);
            return status(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let upstream = match dialer.dial(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("failed to reach {}:{}: {}", host, port, e);
            return status(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    let server_name = match ServerName::try_from(host.clone()) {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!("invalid server name {}: {}", host, e);
            return status(StatusCode::BAD_REQUEST);
        }
    };
    let server = match TlsConnector::from(Arc::clone(&state.upstream_tls))
        .connect(server_name, upstream)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("TLS handshake with {} failed: {}", host, e);
            return status(StatusCode::BAD_GATEWAY);
        }
    };

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::debug!("upgrade for {} failed: {}", host, e);
                return;
            }
        };

        let acceptor = TlsAcceptor::from(Arc::clone(&leaf.server_config));
        let client = match acceptor.accept(TokioIo::new(upgraded)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("client TLS handshake for {} failed: {}", host, e);
                return;
            }
        };

        mitm::run(client, server, state.adapter.clone(), state.control.clone()).await;
    });

    connection_established()
}

async fn passthrough(
    req: Request<Incoming>,
    dialer: UpstreamDialer,
    host: String,
    port: u16,
) -> Response<ProxyBody> {
    let target = match dialer.dial(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("failed to reach {}:{}: {}", host, port, e);
            return status(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                tunnel::forward(TokioIo::new(upgraded), target).await;
            }
            Err(e) => tracing::debug!("upgrade for {}:{} failed: {}", host, port, e),
        }
    });

    connection_established()
}

// =============================================================================
// Plain HTTP
// =============================================================================

async fn forward_http(state: Arc<ProxyState>, mut req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(host) = req.uri().host().map(str::to_string) else {
        return status(StatusCode::BAD_REQUEST);
    };
    let port = req.uri().port_u16().unwrap_or(DEFAULT_HTTP_PORT);

    let dialer = match state.policy.dialer() {
        Ok(dialer) => dialer,
        Err(e) => {
            tracing::warn!("upstream proxy unusable: {}", e);
            return status(StatusCode::BAD_GATEWAY);
        }
    };

    let (stream, absolute_form) = match dialer.open_http(&host, port).await {
        Ok(opened) => opened,
        Err(e) => {
            tracing::debug!("failed to reach {}:{}: {}", host, port, e);
            return status(StatusCode::BAD_GATEWAY);
        }
    };

    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                req.headers_mut().insert(HOST, value);
            }
        }
    }
    req.headers_mut().remove("proxy-connection");
    req.headers_mut().remove(PROXY_AUTHORIZATION);

    if absolute_form {
        if let Some(auth) = dialer.proxy_authorization() {
            if let Ok(value) = HeaderValue::from_str(auth) {
                req.headers_mut().insert(PROXY_AUTHORIZATION, value);
            }
        }
    } else {
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        match path.parse::<Uri>() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(_) => return status(StatusCode::BAD_REQUEST),
        }
    }

    let (mut sender, conn) = match ClientBuilder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await
    {
        Ok(parts) => parts,
        Err(e) => {
            tracing::debug!("handshake with {}:{} failed: {}", host, port, e);
            return status(StatusCode::BAD_GATEWAY);
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("upstream connection error: {}", e);
        }
    });

    match sender.send_request(req).await {
        Ok(response) => response.map(|body| body.boxed()),
        Err(e) => {
            tracing::debug!("request to {}:{} failed: {}", host, port, e);
            status(StatusCode::BAD_GATEWAY)
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status(code: StatusCode) -> Response<ProxyBody> {
    let reason = code.canonical_reason().unwrap_or_default();
    let mut response = Response::new(full(reason));
    *response.status_mut() = code;
    response
}

fn connection_established() -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    response
}
