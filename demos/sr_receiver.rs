//! Receive one message over the selective-repeat transport and report a
//! checksum, optionally writing the payload to a file.
//!
//! Pair with `sr_sender`:
//!
//! ```text
//! cargo run --example sr_receiver -- --port 7000
//! cargo run --example sr_sender   -- --host 127.0.0.1 --port 7000
//! ```

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use bulklink::reliability::{SrConfig, SrReceiver};
use bulklink::{Connection, Context, WireParams};

#[derive(Parser)]
#[command(about = "bulklink selective-repeat receiver")]
struct Args {
    /// TCP control port to listen on.
    #[arg(long, default_value_t = 7000)]
    port: u16,

    /// Largest transfer to accept, in KiB.
    #[arg(long, default_value_t = 64 * 1024)]
    max_kib: usize,

    /// First UDP channel port (0 lets the OS pick).
    #[arg(long, default_value_t = 0)]
    channel_base_port: u16,

    /// Write the received payload here instead of discarding it.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Give up after this many milliseconds without progress.
    #[arg(long, default_value_t = 30_000)]
    progress_timeout_ms: u64,
}

fn checksum(data: &[u8]) -> u64 {
    // FNV-1a, enough to eyeball end-to-end integrity.
    data.iter().fold(0xcbf29ce484222325u64, |h, &b| {
        (h ^ u64::from(b)).wrapping_mul(0x100000001b3)
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let ctx = Context::new();
    println!("listening on tcp port {}", args.port);
    let conn = Connection::listen(&ctx, args.port).context("accept control peer")?;
    conn.set_params(WireParams {
        channel_base_port: args.channel_base_port,
        ..WireParams::default()
    });

    let cfg = SrConfig {
        progress_timeout_ms: args.progress_timeout_ms,
        ..SrConfig::default()
    };
    let mut rx = SrReceiver::new(cfg);
    let data = rx
        .run(&conn, vec![0u8; args.max_kib * 1024])
        .context("receive message")?;

    println!(
        "received {} bytes, fnv1a {:016x}, acks {} nacks {}",
        data.len(),
        checksum(&data),
        rx.stats().acks_sent,
        rx.stats().nacks_sent,
    );
    if let Some(path) = args.output {
        std::fs::write(&path, &data).with_context(|| format!("write {}", path.display()))?;
        println!("wrote {}", path.display());
    }
    Ok(())
}
