//! Host side of SDS I/O
//!
//! Accepts one client at a time and stores every recorded stream as
//! `<name>.<index>.sds` in the output directory; playback streams are served
//! from the same files.

use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdsio::{DirKV, KVBuffers, SdsioServer};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sdsio-server")]
#[command(about = "Record and play back SDS streams for a remote client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve clients connecting over TCP
    Socket {
        /// Local address to bind
        #[arg(long, default_value = "0.0.0.0")]
        ipaddr: IpAddr,

        #[arg(long, default_value_t = sdsio::transport::DEFAULT_PORT)]
        port: u16,

        /// Directory holding the .sds files
        #[arg(long, default_value = ".")]
        outdir: PathBuf,

        /// Largest frame payload accepted from the client
        #[arg(long, default_value_t = 16 * 1024)]
        max_payload: usize,
    },

    /// Serve a client attached to a serial port
    #[cfg(feature = "serial")]
    Serial {
        /// Serial port, e.g. /dev/ttyACM0 or COM3
        #[arg(short = 'p', long)]
        port: String,

        #[arg(long, default_value_t = 115_200)]
        baudrate: u32,

        #[arg(long, value_enum, default_value = "none")]
        parity: serial::Parity,

        #[arg(long, value_enum, default_value = "one")]
        stopbits: serial::StopBits,

        /// Directory holding the .sds files
        #[arg(long, default_value = ".")]
        outdir: PathBuf,

        /// Largest frame payload accepted from the client
        #[arg(long, default_value_t = 16 * 1024)]
        max_payload: usize,
    },
}

fn open_store(outdir: &Path) -> Result<DirKV> {
    DirKV::new(outdir).with_context(|| format!("cannot use output directory {}", outdir.display()))
}

async fn interrupted() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Serve one client after another until `shutdown` completes.
///
/// A client that fails, at accept or later, only ends its own session.
async fn accept_loop<K, F>(listener: &TcpListener, server: &mut SdsioServer<K>, shutdown: F)
where
    K: KVBuffers,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = &mut shutdown => break,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        info!(%peer, "client connected");
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer, error = %e, "cannot configure client socket");
            continue;
        }
        let (reader, writer) = stream.into_split();

        let stop = tokio::select! {
            result = server.serve(reader, writer) => {
                match result {
                    Ok(()) => info!(%peer, "client disconnected"),
                    Err(e) => warn!(%peer, error = %e, "session ended"),
                }
                false
            }
            () = &mut shutdown => true,
        };
        if stop {
            server.clear().await;
            break;
        }
    }
}

async fn run_socket(ipaddr: IpAddr, port: u16, outdir: PathBuf, max_payload: usize) -> Result<()> {
    let mut server = SdsioServer::new(open_store(&outdir)?, max_payload);
    let listener = TcpListener::bind((ipaddr, port))
        .await
        .with_context(|| format!("cannot listen on {ipaddr}:{port}"))?;
    info!(addr = %listener.local_addr()?, outdir = %outdir.display(), "waiting for clients");

    accept_loop(&listener, &mut server, interrupted()).await;
    info!("shutting down");
    Ok(())
}

#[cfg(feature = "serial")]
mod serial {
    use super::{info, interrupted, open_store, warn, PathBuf, Result, SdsioServer};
    use anyhow::Context;
    use clap::ValueEnum;
    use tokio_serial::SerialPortBuilderExt;

    #[derive(Debug, Clone, Copy, ValueEnum)]
    pub enum Parity {
        None,
        Even,
        Odd,
    }

    #[derive(Debug, Clone, Copy, ValueEnum)]
    pub enum StopBits {
        One,
        Two,
    }

    pub async fn run(
        port: String,
        baudrate: u32,
        parity: Parity,
        stopbits: StopBits,
        outdir: PathBuf,
        max_payload: usize,
    ) -> Result<()> {
        let mut server = SdsioServer::new(open_store(&outdir)?, max_payload);
        let parity = match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match stopbits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        };
        let stream = tokio_serial::new(&port, baudrate)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .with_context(|| format!("cannot open serial port {port}"))?;
        info!(port = %port, baudrate, outdir = %outdir.display(), "serving serial client");

        let (reader, writer) = tokio::io::split(stream);
        tokio::select! {
            result = server.serve(reader, writer) => {
                if let Err(e) = result {
                    warn!(error = %e, "session ended");
                }
            }
            () = interrupted() => {}
        }
        server.clear().await;
        info!("shutting down");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Socket {
            ipaddr,
            port,
            outdir,
            max_payload,
        } => run_socket(ipaddr, port, outdir, max_payload).await,
        #[cfg(feature = "serial")]
        Commands::Serial {
            port,
            baudrate,
            parity,
            stopbits,
            outdir,
            max_payload,
        } => serial::run(port, baudrate, parity, stopbits, outdir, max_payload).await,
    }
}
