use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::RngCore;
use tracing::{info, warn};

use ctrl_base::{Config, CtrlApp, CtrlSession, RtcTime, SessionOptions};

/// Temperature simulator over a CTRL session: sends a random 4-byte
/// reading on a fixed interval and logs whatever the server pushes back.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Binary configuration blob (magic + base id + key + server).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server address, e.g. 127.0.0.1:8000 (ignored with --config).
    #[arg(long, default_value = "127.0.0.1:8000")]
    server: String,

    /// 16-byte base id, hex (ignored with --config).
    #[arg(long, default_value = "000102030405060708090a0b0c0d0e0f")]
    base_id: String,

    /// 16-byte AES-128 key, hex (ignored with --config).
    #[arg(long, default_value = "00000000000000000000000000000000")]
    key: String,

    /// Seconds between simulated readings.
    #[arg(long, default_value_t = 5)]
    interval: u64,

    /// Send straight to the wire instead of through the outbox.
    #[arg(long, default_value_t = false)]
    no_outbox: bool,
}

struct LoggerApp;

impl CtrlApp for LoggerApp {
    fn on_app_message(&mut self, header: u8, tx_sender: u32, payload: &[u8]) {
        info!(header, tx_sender, payload = %hex::encode(payload), "app message");
    }

    fn on_ack(&mut self, header: u8, tx_sender: u32) {
        info!(header, tx_sender, "ack");
    }

    fn on_auth_ok(&mut self) {
        info!("authenticated with server");
    }

    fn rtc_set(&mut self, rtc: RtcTime) {
        info!(
            "rtc: {:04}-{:02}-{:02} {:02}:{:02}:{:02} (weekday {})",
            rtc.year, rtc.month, rtc.day, rtc.hour, rtc.minute, rtc.second, rtc.weekday
        );
    }
}

fn hex16(s: &str, what: &str) -> Result<[u8; 16]> {
    let raw = hex::decode(s).with_context(|| format!("{what}: not hex"))?;
    if raw.len() != 16 {
        bail!("{what}: expected 16 bytes, got {}", raw.len());
    }
    Ok(raw.try_into().expect("length checked"))
}

fn build_config(args: &Args) -> Result<Config> {
    if let Some(path) = &args.config {
        return Config::load(path).with_context(|| format!("loading {}", path.display()));
    }
    let addr: SocketAddrV4 = args.server.parse().context("--server: expected ip:port")?;
    Ok(Config {
        base_id: hex16(&args.base_id, "--base-id")?,
        key: hex16(&args.key, "--key")?,
        server_ip: addr.ip().octets(),
        server_port: addr.port(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    let cfg = build_config(&args)?;

    let opts = SessionOptions { use_outbox: !args.no_outbox, ..SessionOptions::default() };
    let (handle, join) = CtrlSession::spawn(cfg, opts, LoggerApp);

    let mut tick = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let reading = rand::rngs::OsRng.next_u32();
                match handle.send(&reading.to_le_bytes(), false).await {
                    Ok(()) => info!(reading, "temperature queued"),
                    Err(e) => warn!(error = %e, "could not send reading"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = handle.shutdown().await;
                break;
            }
        }
    }

    let _ = join.await;
    Ok(())
}
