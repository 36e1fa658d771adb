use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Posecast - a real-time animation pose streaming server.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Run the HTTP/WebSocket front end (default).
  Serve(ServeArgs),
  /// Run a pose-producer worker for one session. Spawned by the server.
  #[command(hide = true)]
  Worker(WorkerArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
  /// Address the HTTP/WebSocket server binds to.
  #[arg(long, env = "POSECAST_BIND", default_value = "0.0.0.0:9810")]
  pub bind: SocketAddr,
  /// Directory holding BVH animation files.
  #[arg(long, env = "ANIMATION_DIR")]
  pub animation_dir: PathBuf,
  /// Directory holding variational decoder models. Required for VAE sessions.
  #[arg(long, env = "VAE_DIR")]
  pub vae_dir: Option<PathBuf>,
  /// Default tick rate for new sessions, in frames per second.
  #[arg(long, default_value_t = 60.0)]
  pub fps: f64,
  /// Slot count of the per-session frame buffer.
  #[arg(long, default_value_t = 3)]
  pub buffers: usize,
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
  /// Animator kind, "FK" or "VAE".
  #[arg(long)]
  pub kind: String,
  /// Animation source file the animator loads.
  #[arg(long)]
  pub source: PathBuf,
  /// Session runtime directory holding the control/frame sockets and slots.
  #[arg(long)]
  pub dir: PathBuf,
  /// Initial tick rate in frames per second.
  #[arg(long, default_value_t = 60.0)]
  pub fps: f64,
  /// Slot count of the shared frame buffer.
  #[arg(long, default_value_t = 3)]
  pub buffers: usize,
}
