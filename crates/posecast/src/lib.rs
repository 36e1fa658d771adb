//! Posecast streams real-time skeletal animation poses to WebSocket clients.
//!
//! Each *session* is one isolated animation instance: a worker process hosts
//! the pose generator and writes frames into a shared slot region, while the
//! front end fans those frames out to every subscriber and drives the worker
//! through a framed command channel. The HTTP surface (create/delete
//! sessions, playback control) and the `/ws/{session_id}` streaming endpoint
//! live in [`server`]; the cross-process plumbing lives in [`transport`],
//! [`worker`], and [`session`].

use anyhow::Result;
use clap::Parser;

pub mod animator;
pub mod args;
pub mod config;
pub mod error;
pub mod logging;
pub mod math;
pub mod server;
pub mod session;
pub mod skeleton;
pub mod transport;
pub mod worker;

use args::{Cli, Command, ServeArgs};
use config::Config;

pub fn run() -> Result<()> {
  let cli = Cli::parse();
  logging::init();
  let command = match cli.command {
    Some(command) => command,
    // No subcommand: serve with env-provided settings.
    None => Cli::try_parse_from(["posecast", "serve"])?
      .command
      .expect("serve subcommand"),
  };
  match command {
    Command::Worker(args) => worker::run(&args),
    Command::Serve(args) => serve_blocking(args),
  }
}

fn serve_blocking(args: ServeArgs) -> Result<()> {
  let config = Config::try_from(args)?;
  tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?
    .block_on(server::serve(config))
}
