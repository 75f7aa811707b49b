//
// The davshare server binary.
//
// Listens on plain http; TLS termination and process supervision are
// someone else's job.
//
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use log::{error, info};
use tokio::net::TcpListener;

use davshare::config::{Config, Share, ShareKind};
use davshare::DavRouter;

#[derive(Parser)]
#[command(name = "davshare", version, about = "WebDAV server with mountable shares")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server.
    Serve {
        /// Address to listen on.
        #[arg(long)]
        host:   Option<String>,
        /// Port to listen on.
        #[arg(long)]
        port:   Option<u16>,
        /// Configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let (host, port, config) = match cli.command {
        Command::Serve { host, port, config } => (host, port, config),
    };

    let mut config = match config {
        Some(path) => {
            match Config::from_file(&path) {
                Ok(c) => c,
                Err(e) => {
                    error!("config error: {}", e);
                    return ExitCode::from(2);
                },
            }
        },
        None => {
            // no config file: one writable in-memory repository at "/".
            let mut c = Config::default();
            c.host = "127.0.0.1".to_string();
            c.port = 4918;
            c.shares.insert(
                "/".to_string(),
                Share {
                    kind:      ShareKind::Repo,
                    directory: None,
                    read_only: false,
                },
            );
            c
        },
    };
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let router = match DavRouter::from_config(&config) {
        Ok(r) => r,
        Err(e) => {
            error!("config error: {}", e);
            return ExitCode::from(2);
        },
    };
    router.spawn_lock_sweeper(Duration::from_secs(60));

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(a) => a,
        Err(_) => {
            error!("invalid listen address {}:{}", config.host, config.port);
            return ExitCode::from(2);
        },
    };
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("bind {}: {}", addr, e);
            return ExitCode::from(1);
        },
    };
    info!("listening on {}", addr);

    loop {
        let (stream, _client_addr) = tokio::select! {
            conn = listener.accept() => {
                match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept: {}", e);
                        continue;
                    },
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return ExitCode::SUCCESS;
            },
        };

        let router = router.clone();
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(move |req: hyper::Request<Incoming>| {
                let router = router.clone();
                async move { Ok::<_, Infallible>(router.handle(req).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                log::debug!("connection error: {:?}", err);
            }
        });
    }
}
