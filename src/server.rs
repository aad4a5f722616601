use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::future;
use http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_TYPE};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body as HttpBody, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::inject::{inject_instrumentation, is_injectable_path};
use crate::rewrite::{
    apply_cors_headers, build_target_uri, response_headers, rewrite_request_headers,
    upgrade_request_headers,
};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

fn boxed<B>(body: B) -> BoxBody
where
    B: HttpBody<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    body.map_err(Into::into).boxed()
}

fn assemble_response(status: StatusCode, headers: HeaderMap, body: BoxBody) -> Response<BoxBody> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

fn response_with(status: StatusCode, msg: String) -> Response<BoxBody> {
    let mut resp = Response::new(boxed(Full::new(Bytes::from(msg))));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Bind the listener and serve the proxy until `shutdown` resolves, then
/// stop accepting and drain in-flight connections. Bind errors surface to
/// the caller; the listener never starts half-configured.
pub async fn spawn_proxy<S>(cfg: ProxyConfig, shutdown: S) -> Result<(SocketAddr, JoinHandle<()>)>
where
    S: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen))?;
    let local_addr = listener.local_addr().context("listener local addr")?;

    // One pooled client per instance; plain or TLS transport is picked per
    // request by the target scheme, which here is always the pinned origin's.
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    let client: HttpClient = Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(8)
        .build(https);

    let cfg = Arc::new(cfg);
    let handle = tokio::spawn(async move {
        let graceful = GracefulShutdown::new();
        let notify = Arc::new(Notify::new());
        {
            let notify = notify.clone();
            tokio::spawn(async move {
                shutdown.await;
                notify.notify_waiters();
            });
        }

        loop {
            tokio::select! {
                _ = notify.notified() => {
                    info!("shutting down, draining in-flight connections");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let io = TokioIo::new(stream);
                            let client = client.clone();
                            let cfg = cfg.clone();
                            let service = service_fn(move |req| {
                                handle_request(client.clone(), cfg.clone(), remote_addr, req)
                            });
                            let conn = auto::Builder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(io, service)
                                .into_owned();
                            let conn = graceful.watch(conn);
                            tokio::spawn(async move {
                                if let Err(err) = conn.await {
                                    error!(%err, "connection error");
                                }
                            });
                        }
                        Err(err) => {
                            error!(%err, "accept error");
                        }
                    }
                }
            }
        }

        drop(listener);
        graceful.shutdown().await;
    });

    Ok((local_addr, handle))
}

async fn handle_request(
    client: HttpClient,
    cfg: Arc<ProxyConfig>,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Infallible> {
    // Preflights are answered locally; the upstream is never contacted.
    if req.method() == Method::OPTIONS {
        return Ok(preflight_response(&cfg));
    }

    let allow_origin = cfg.allow_origin.clone();
    let result = if is_upgrade_request(&req) {
        handle_upgrade(client, cfg, remote_addr, req).await
    } else {
        handle_http(client, cfg, remote_addr, req).await
    };
    match result {
        Ok(resp) => Ok(resp),
        Err(mut resp) => {
            // Error responses carry the CORS set too.
            apply_cors_headers(resp.headers_mut(), &allow_origin);
            Ok(resp)
        }
    }
}

fn preflight_response(cfg: &ProxyConfig) -> Response<BoxBody> {
    let mut headers = HeaderMap::new();
    apply_cors_headers(&mut headers, &cfg.allow_origin);
    assemble_response(StatusCode::OK, headers, boxed(Empty::<Bytes>::new()))
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_conn_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_conn_upgrade && req.headers().contains_key("upgrade")
}

async fn handle_http(
    client: HttpClient,
    cfg: Arc<ProxyConfig>,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Response<BoxBody>> {
    let target = build_target_uri(&cfg.upstream, req.uri()).map_err(|_| {
        response_with(
            StatusCode::BAD_REQUEST,
            format!("invalid request target: {}", req.uri()),
        )
    })?;
    let path = req.uri().path().to_string();
    let injectable = is_injectable_path(&path);
    let headers = rewrite_request_headers(req.headers(), &cfg.upstream, injectable);

    let (parts, body) = req.into_parts();
    let mut upstream_req = Request::builder()
        .method(parts.method.clone())
        .uri(target)
        .body(boxed(body))
        .map_err(|_| {
            response_with(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to build upstream request".into(),
            )
        })?;
    *upstream_req.headers_mut() = headers;

    info!(
        client = %remote_addr,
        method = %parts.method,
        path = %path,
        upstream = %cfg.upstream,
        injectable,
        "proxy http"
    );

    let upstream_resp = client
        .request(upstream_req)
        .await
        .map_err(|e| response_with(StatusCode::BAD_GATEWAY, format!("Upstream error: {e}")))?;

    if !injectable {
        // Default path: stream the upstream body straight through.
        let headers = response_headers(upstream_resp.headers(), &cfg.allow_origin, None);
        let status = upstream_resp.status();
        return Ok(assemble_response(
            status,
            headers,
            boxed(upstream_resp.into_body()),
        ));
    }

    // Injectable path: buffer the whole document, rewrite, send in one shot.
    let (parts, body) = upstream_resp.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| response_with(StatusCode::BAD_GATEWAY, format!("Upstream error: {e}")))?
        .to_bytes();
    let injected = inject_instrumentation(&bytes).map_err(|e| {
        response_with(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Injection error: response body is not valid text: {e}"),
        )
    })?;
    let headers = response_headers(&parts.headers, &cfg.allow_origin, Some(injected.len()));
    Ok(assemble_response(
        parts.status,
        headers,
        boxed(Full::new(Bytes::from(injected))),
    ))
}

async fn handle_upgrade(
    client: HttpClient,
    cfg: Arc<ProxyConfig>,
    remote_addr: SocketAddr,
    mut req: Request<Incoming>,
) -> Result<Response<BoxBody>, Response<BoxBody>> {
    let target = build_target_uri(&cfg.upstream, req.uri()).map_err(|_| {
        response_with(
            StatusCode::BAD_REQUEST,
            format!("invalid request target: {}", req.uri()),
        )
    })?;
    let headers = upgrade_request_headers(req.headers(), &cfg.upstream);

    let mut proxied_req = Request::builder()
        .method(req.method().clone())
        .uri(target)
        .body(boxed(Empty::<Bytes>::new()))
        .map_err(|_| {
            response_with(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to build upgrade request".into(),
            )
        })?;
    *proxied_req.headers_mut() = headers;

    info!(
        client = %remote_addr,
        path = %req.uri().path(),
        upstream = %cfg.upstream,
        "proxy upgrade"
    );

    let upstream_resp = client
        .request(proxied_req)
        .await
        .map_err(|e| response_with(StatusCode::BAD_GATEWAY, format!("Upstream error: {e}")))?;

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        // Upstream declined the upgrade; relay its answer as-is.
        let (parts, body) = upstream_resp.into_parts();
        return Ok(assemble_response(parts.status, parts.headers, boxed(body)));
    }

    // Mirror the upstream handshake headers verbatim to the client.
    let mut headers = upstream_resp.headers().clone();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    let client_resp = assemble_response(
        StatusCode::SWITCHING_PROTOCOLS,
        headers,
        boxed(Empty::<Bytes>::new()),
    );

    // Splice the two sockets once both sides have upgraded.
    tokio::spawn(async move {
        match future::try_join(
            hyper::upgrade::on(&mut req),
            hyper::upgrade::on(upstream_resp),
        )
        .await
        {
            Ok((client_upgraded, upstream_upgraded)) => {
                tunnel(TokioIo::new(client_upgraded), TokioIo::new(upstream_upgraded)).await;
            }
            Err(err) => {
                warn!(%err, "upgrade handshake error");
            }
        }
    });

    Ok(client_resp)
}

/// Relay bytes between the two upgraded sockets. Two directional copy
/// tasks race; when either side closes or errors, the other direction is
/// cancelled and both sockets are shut down.
async fn tunnel<C, U>(client_io: C, upstream_io: U)
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client_io);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream_io);

    let client_to_upstream = tokio::io::copy(&mut client_read, &mut upstream_write);
    let upstream_to_client = tokio::io::copy(&mut upstream_read, &mut client_write);

    tokio::select! {
        result = client_to_upstream => {
            if let Err(err) = result {
                warn!(%err, "client to upstream copy ended");
            }
        }
        result = upstream_to_client => {
            if let Err(err) = result {
                warn!(%err, "upstream to client copy ended");
            }
        }
    }

    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;
}
