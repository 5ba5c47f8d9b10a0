use std::error::Error;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing_subscriber::EnvFilter;

use forkshm::{Channel, ChannelConfig, Registry, ShmemError, Thread, WorkerConfig};

const END_MARKER: u64 = u64::MAX;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "forkshm-bench.toml")]
    config: String,
    #[clap(short = 'n', long = "messages", default_value = "1000000")]
    messages: u64,
    /// Check that messages arrive in the order they were sent.
    #[clap(long)]
    verify: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    channel: ChannelConfig,
    writer: WorkerConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    cfg.channel.validate()?;
    cfg.writer.validate()?;

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))?;
    }

    tracing::info!(
        config = %opts.config,
        capacity = cfg.channel.capacity,
        lock = ?cfg.channel.lock,
        datagram_threshold = ?cfg.channel.datagram_threshold,
        messages = opts.messages,
        "starting channel bench"
    );

    let registry = Registry::new();
    let channel = Channel::new(&registry, &cfg.channel)?;
    let mut writer = spawn_writer(&registry, &cfg.writer, &channel, opts.messages, Arc::clone(&stop))?;

    let start = Instant::now();
    let received = read_messages(&channel, opts.verify)?;
    let duration = start.elapsed();

    writer.join()?;
    let sent = *writer.result()?;
    if sent != received {
        return Err(Box::new(ShmemError::Logic(format!(
            "writer sent {} messages but {} arrived",
            sent, received
        ))));
    }

    let rate = received as f64 / duration.as_secs_f64();
    println!(
        "\n{:#?}K messages/s. Total time: {:#?}",
        (rate / 1000f64) as u64,
        duration
    );
    if stop.load(Ordering::Relaxed) {
        tracing::info!(received, "stopped early by signal");
    }
    Ok(())
}

fn spawn_writer(
    registry: &Registry,
    config: &WorkerConfig,
    channel: &Channel,
    messages: u64,
    stop: Arc<AtomicBool>,
) -> Result<Thread<u64>, ShmemError> {
    let sender = channel.try_clone()?;
    let mut writer = Thread::with_state(registry, config, (), move |_| {
        let mut sent = 0u64;
        while sent < messages && !stop.load(Ordering::Relaxed) {
            send(&sender, sent)?;
            sent += 1;
        }
        send(&sender, END_MARKER)?;
        Ok::<_, ShmemError>(sent)
    })?;
    writer.start()?;
    Ok(writer)
}

// Spins while the reader catches up.
fn send(channel: &Channel, seq: u64) -> Result<(), ShmemError> {
    loop {
        match channel.send_bytes(&seq.to_le_bytes()) {
            Err(e) if e.is_retryable() => hint::spin_loop(),
            other => return other,
        }
    }
}

fn read_messages(channel: &Channel, verify: bool) -> Result<u64, ShmemError> {
    let mut received = 0u64;
    loop {
        let message = channel.receive_bytes(true)?;
        let raw: [u8; 8] = message
            .as_slice()
            .try_into()
            .map_err(|_| ShmemError::Logic(format!("unexpected {} byte message", message.len())))?;
        let seq = u64::from_le_bytes(raw);
        if seq == END_MARKER {
            return Ok(received);
        }
        if verify && seq != received {
            return Err(ShmemError::Logic(format!("expected message {}, got {}", received, seq)));
        }
        received += 1;
        if received % 1_000_000 == 0 {
            eprint!("\rTotal {} messages", received);
        }
    }
}
