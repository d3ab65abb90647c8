//! Send a file (or a generated payload) over the selective-repeat
//! transport.
//!
//! Pair with `sr_receiver`:
//!
//! ```text
//! cargo run --example sr_receiver -- --port 7000
//! cargo run --example sr_sender   -- --host 127.0.0.1 --port 7000 --size-kib 4096
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context as _;
use clap::Parser;
use rand::RngCore;

use bulklink::reliability::{SrConfig, SrSender};
use bulklink::{Connection, Context, WireParams};

#[derive(Parser)]
#[command(about = "bulklink selective-repeat sender")]
struct Args {
    /// Receiver's control address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Receiver's TCP control port.
    #[arg(long, default_value_t = 7000)]
    port: u16,

    /// File to send; omitted, a random payload of `--size-kib` is used.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Generated payload size in KiB.
    #[arg(long, default_value_t = 1024)]
    size_kib: usize,

    /// Desired payload bytes per packet.
    #[arg(long, default_value_t = 1024)]
    mtu: u32,

    /// Desired packets per chunk.
    #[arg(long, default_value_t = 32)]
    packets_per_chunk: u16,

    /// Desired UDP channel count.
    #[arg(long, default_value_t = 1)]
    channels: u16,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let data = match &args.file {
        Some(path) => std::fs::read(path).with_context(|| format!("read {}", path.display()))?,
        None => {
            let mut data = vec![0u8; args.size_kib * 1024];
            rand::thread_rng().fill_bytes(&mut data);
            data
        }
    };

    let ctx = Context::new();
    let conn =
        Connection::connect(&ctx, &args.host, args.port).context("connect control stream")?;
    conn.set_params(WireParams {
        mtu_bytes: args.mtu,
        packets_per_chunk: args.packets_per_chunk,
        num_channels: args.channels,
        ..WireParams::default()
    });

    let mut tx = SrSender::new(SrConfig::default());
    let start = Instant::now();
    tx.run(&conn, &data).context("send message")?;
    let elapsed = start.elapsed();

    let mib = data.len() as f64 / (1024.0 * 1024.0);
    println!(
        "sent {} bytes in {:.2?} ({:.1} MiB/s), {} chunks retransmitted",
        data.len(),
        elapsed,
        mib / elapsed.as_secs_f64(),
        tx.stats().retransmits,
    );
    Ok(())
}
