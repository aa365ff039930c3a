//! Meshroom CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use event_log::LogFormat;
use meshroom_core::file_transfer::chunk_count;
use meshroom_core::prelude::*;
use meshroom_core::{content_hash, Frame, FrameGrabber, MemoryRelay, RemoteFrameSource};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

mod event_log;
#[cfg(test)]
mod event_log_tests;

const CONFIG_FILE: &str = "config.json";

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local participant name (random if omitted)
    #[arg(short, long, env = "MESHROOM_IDENTITY")]
    identity: Option<String>,

    /// JSON room configuration (defaults to the per-user config file, if present)
    #[arg(short, long, env = "MESHROOM_CONFIG")]
    config: Option<PathBuf>,

    /// Event output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process room with simulated participants
    Demo {
        /// Room name
        #[arg(long, default_value = "demo")]
        room: String,

        /// Number of simulated participants besides the local one
        #[arg(long, default_value = "2")]
        peers: usize,

        /// File to share once everyone is connected (random data if omitted)
        #[arg(long)]
        file: Option<PathBuf>,

        /// How long to keep the room open after the transfer
        #[arg(long, default_value = "3")]
        seconds: u64,
    },

    /// Print the digest and chunk layout a transfer of this file would use
    Hash {
        /// File to inspect
        file: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshroom_cli=info,meshroom_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            room,
            peers,
            file,
            seconds,
        } => {
            let identity = cli.identity.unwrap_or_else(generate_random_identity);
            handle_demo(config, &identity, &room, peers, file, seconds, cli.format).await?;
        }
        Commands::Hash { file } => {
            handle_hash(&config, &file)?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Explicit path, else the per-user config file, else defaults
fn load_config(explicit: Option<&Path>) -> Result<RoomConfig> {
    if let Some(path) = explicit {
        return RoomConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            tracing::debug!(path = %path.display(), "Using per-user configuration");
            RoomConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        _ => Ok(RoomConfig::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "meshroom", "meshroom")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

struct Participant {
    room: Arc<Room<MemoryRelay>>,
    task: JoinHandle<()>,
}

async fn spawn_participant(
    hub: &Arc<MemoryRelayHub>,
    network: &Arc<LoopbackNetwork>,
    config: &RoomConfig,
    room_id: &str,
    identity: &str,
) -> Result<Participant> {
    let camera = Arc::new(SyntheticCamera::new(64, 48));
    let room = Room::builder(
        Arc::new(hub.connect(identity)),
        RoomId::new(room_id),
        Arc::new(network.factory(identity)),
        Arc::new(SyntheticDevices::new()),
    )
    .with_config(config.clone())
    .with_frames(Some(camera.clone() as Arc<dyn FrameGrabber>), camera)
    .build()
    .with_context(|| format!("building room for {identity}"))?;

    let room = Arc::new(room);
    room.enter(MediaConstraints::video_call())
        .await
        .with_context(|| format!("{identity} entering {room_id}"))?;

    let runner = Arc::clone(&room);
    let task = tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            tracing::warn!(error = %e, "Room loop ended with error");
        }
    });
    Ok(Participant { room, task })
}

async fn handle_demo(
    config: RoomConfig,
    identity: &str,
    room_id: &str,
    peers: usize,
    file: Option<PathBuf>,
    seconds: u64,
    format: LogFormat,
) -> Result<()> {
    println!("🔗 Using identity: {identity}");
    println!("🏠 Room: {room_id} with {peers} simulated participant(s)");

    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let local = spawn_participant(&hub, &network, &config, room_id, identity).await?;
    let mut events = local.room.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = event_log::describe(&event) {
                        println!("{}", line.render(format));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut others = Vec::with_capacity(peers);
    for _ in 0..peers {
        let name = generate_random_identity();
        others.push(spawn_participant(&hub, &network, &config, room_id, &name).await?);
    }

    wait_for_mesh(&local.room, peers).await;
    println!("✅ Connected to {} of {peers} participant(s)", local.room.registry().len());

    let outgoing = match file {
        Some(path) => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            OutgoingFile::new(filename, "application/octet-stream", data)
        }
        None => {
            let mut data = vec![0u8; 96 * 1024];
            rand::thread_rng().fill(data.as_mut_slice());
            OutgoingFile::new("random.bin", "application/octet-stream", data)
        }
    };
    let report = local.room.send_file(outgoing, None).await?;
    println!(
        "📦 Sent {} in {} chunk(s), {:.2} MB/s",
        report.meta.filename, report.meta.total_chunks, report.throughput_mbps
    );

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let history = local.room.quality_history();
    println!("📊 {} quality sample(s) recorded", history.len());

    for participant in others.iter().chain(std::iter::once(&local)) {
        participant.room.leave().await;
    }
    for participant in others.into_iter().chain(std::iter::once(local)) {
        let _ = participant.task.await;
    }
    printer.abort();
    println!("👋 Room closed");
    Ok(())
}

async fn wait_for_mesh(room: &Room<MemoryRelay>, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let connected = room
            .registry()
            .sessions()
            .iter()
            .filter(|s| s.connection_state() == ConnectionState::Connected)
            .count();
        if connected >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tracing::warn!(expected, "Not every participant connected in time");
}

fn handle_hash(config: &RoomConfig, path: &Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let size = data.len() as u64;
    println!("📄 {}", path.display());
    println!("   Size:   {size} bytes");
    println!("   SHA256: {}", content_hash(&data));
    println!(
        "   Chunks: {} x {} bytes",
        chunk_count(size, config.chunk_size),
        config.chunk_size
    );
    Ok(())
}

/// Moving gradient as the local camera, with a noisy copy as what peers render
struct SyntheticCamera {
    width: u32,
    height: u32,
}

impl SyntheticCamera {
    fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn gradient(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity((self.width * self.height * 4) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let v = ((x * 4 + y * 2) % 256) as u8;
                data.extend_from_slice(&[v, 255 - v, v / 2, 255]);
            }
        }
        data
    }
}

impl FrameGrabber for SyntheticCamera {
    fn grab(&self) -> Option<Frame> {
        Frame::new(self.width, self.height, self.gradient())
    }
}

impl RemoteFrameSource for SyntheticCamera {
    fn capture(&self, _peer: &PeerId) -> Option<Frame> {
        let mut rng = rand::thread_rng();
        let data = self
            .gradient()
            .into_iter()
            .map(|v| v.saturating_add(rng.gen_range(0..4)))
            .collect::<Vec<u8>>();
        Frame::new(self.width, self.height, data)
    }
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cedar", "delta", "ember", "fjord", "garnet", "harbor", "iris", "juniper",
        "kestrel", "lagoon", "maple", "nimbus", "onyx", "pebble", "quartz", "raven", "sage",
        "tundra", "umber", "valley", "willow", "yarrow", "zephyr",
    ];

    let mut rng = rand::thread_rng();
    let first = WORDS[rng.gen_range(0..WORDS.len())];
    let second = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{first}-{second}-{}", rng.gen_range(100..1000))
}
