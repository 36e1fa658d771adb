use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::args::ServeArgs;

/// Effective server configuration resolved from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct Config {
  pub bind: SocketAddr,
  /// Directory listed by `GET /animations` and searched for FK sources.
  pub animation_dir: PathBuf,
  /// Directory searched for VAE decoder models, when configured.
  pub vae_dir: Option<PathBuf>,
  /// Default tick rate for new sessions.
  pub fps: f64,
  /// Slot count of each session's shared frame buffer.
  pub buffer_count: usize,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
  #[error("fps must be a positive number, got {0}")]
  InvalidFps(f64),
  /// Slot indices travel as a single byte and slot rotation needs headroom.
  #[error("buffer count must be between 3 and 255, got {0}")]
  InvalidBufferCount(usize),
}

impl TryFrom<ServeArgs> for Config {
  type Error = ConfigError;

  fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
    if !args.fps.is_finite() || args.fps <= 0.0 {
      return Err(ConfigError::InvalidFps(args.fps));
    }
    if args.buffers < 3 || args.buffers > u8::MAX as usize {
      return Err(ConfigError::InvalidBufferCount(args.buffers));
    }
    Ok(Self {
      bind: args.bind,
      animation_dir: args.animation_dir,
      vae_dir: args.vae_dir,
      fps: args.fps,
      buffer_count: args.buffers,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn args(fps: f64, buffers: usize) -> ServeArgs {
    ServeArgs {
      bind: "127.0.0.1:0".parse().unwrap(),
      animation_dir: PathBuf::from("/tmp/animations"),
      vae_dir: None,
      fps,
      buffers,
    }
  }

  #[test]
  fn accepts_sane_settings() {
    let config = Config::try_from(args(60.0, 3)).unwrap();
    assert_eq!(config.fps, 60.0);
    assert_eq!(config.buffer_count, 3);
  }

  #[test]
  fn rejects_bad_fps_and_buffer_counts() {
    assert_eq!(
      Config::try_from(args(0.0, 3)).unwrap_err(),
      ConfigError::InvalidFps(0.0)
    );
    assert_eq!(
      Config::try_from(args(60.0, 2)).unwrap_err(),
      ConfigError::InvalidBufferCount(2)
    );
    assert_eq!(
      Config::try_from(args(60.0, 300)).unwrap_err(),
      ConfigError::InvalidBufferCount(300)
    );
  }
}
