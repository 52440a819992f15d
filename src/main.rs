use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use dapbridge::dispatch::{serve, ClientWriter};
use dapbridge::session::{EngineCatalog, Session};
use dapbridge::transport::FramedReader;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen on a TCP address instead of serving stdio
    /// (e.g. 127.0.0.1:4711).
    #[clap(long)]
    listen: Option<String>,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    oneshot: bool,
}

/// Engines register here. The stock binary ships none; embedders add
/// their backend before calling `serve`.
fn build_catalog() -> EngineCatalog {
    EngineCatalog::new()
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.listen {
        None => {
            let reader = FramedReader::new(BufReader::new(std::io::stdin()));
            let writer = ClientWriter::new(Box::new(std::io::stdout()));
            let session = Session::new(build_catalog(), writer.clone());
            serve(reader, writer, session)
        }
        Some(listen) => {
            let addr: SocketAddr = listen.parse().context("invalid listen address")?;
            let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
            info!(target: "transport", "listening on {addr}");

            // One client at a time; one client == one debug session.
            loop {
                let (stream, peer) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(target: "transport", "accept failed: {error:#}");
                        continue;
                    }
                };
                info!(target: "transport", "client connected: {peer}");
                stream.set_nodelay(true)?;

                let reader = FramedReader::new(BufReader::new(stream.try_clone()?));
                let writer = ClientWriter::new(Box::new(stream) as Box<dyn Write + Send>);
                let session = Session::new(build_catalog(), writer.clone());

                if let Err(error) = serve(reader, writer, session) {
                    warn!(target: "transport", "session ended: {error:#}");
                }

                if args.oneshot {
                    return Ok(());
                }
            }
        }
    }
}
