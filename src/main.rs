use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use tracing::error;

use preview_proxy::config::{ProxyConfig, UpstreamOrigin};
use preview_proxy::server::spawn_proxy;
use preview_proxy::status::{report, StatusMessage};

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Single-origin live-preview reverse proxy with debug instrumentation injection"
)]
struct Args {
    /// Address to bind the preview listener on.
    #[arg(long, env = "PREVIEW_PROXY_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to bind the preview listener on.
    #[arg(long, env = "PREVIEW_PROXY_PORT")]
    port: u16,

    /// Upstream origin to forward to, e.g. http://127.0.0.1:5173.
    #[arg(long, env = "PREVIEW_PROXY_UPSTREAM")]
    upstream: String,

    /// Origin allowed to embed the proxied content in an iframe.
    #[arg(
        long,
        env = "PREVIEW_PROXY_ALLOW_ORIGIN",
        default_value = "http://localhost:3000"
    )]
    allow_origin: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "preview_proxy=info,hyper=warn".into()),
        )
        .compact()
        .init();

    // A single-origin proxy has no meaningful default upstream; an invalid
    // one must fail before the listener binds.
    let upstream = match UpstreamOrigin::resolve(&args.upstream) {
        Ok(origin) => origin,
        Err(err) => {
            eprintln!("invalid configuration: {err:#}");
            std::process::exit(2);
        }
    };
    report(&StatusMessage::Upstream {
        origin: upstream.as_str(),
    });

    let cfg = ProxyConfig {
        listen: SocketAddr::new(args.host, args.port),
        upstream,
        allow_origin: args.allow_origin,
    };

    let shutdown = async {
        let signal = wait_for_termination().await;
        report(&StatusMessage::Shutdown { signal });
    };

    match spawn_proxy(cfg, shutdown).await {
        Ok((addr, handle)) => {
            report(&StatusMessage::Listening {
                url: format!("http://{addr}"),
            });
            if let Err(err) = handle.await {
                error!(%err, "proxy task failed");
                std::process::exit(1);
            }
        }
        Err(err) => {
            report(&StatusMessage::ListenerError {
                message: format!("{err:#}"),
            });
            std::process::exit(1);
        }
    }
}

async fn wait_for_termination() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
