//! Pose-producer worker process.
//!
//! One worker runs per session, isolated from the front end so a crashing
//! pose generator cannot take the server down. Lifecycle:
//! 1. Connect the control socket and load the animator; report
//!    `InitSuccess` (skeleton + frame size) or `InitError` and exit.
//! 2. Await `set_shm` naming the slot region, with a 60 s ceiling.
//! 3. Tick: drain commands, honor pause, write the next pose into slot `k`,
//!    announce `k` without blocking, rotate `k`, sleep out the tick budget.

use std::path::PathBuf;
use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::animator::{self, Animator, AnimatorKind, CommandArgs, Invoke};
use crate::args::WorkerArgs;
use crate::transport::control::{SessionBound, WorkerBound, WorkerEndpoint};
use crate::transport::frames::ReadySender;
use crate::transport::slots::SlotWriter;
use crate::transport::{CONTROL_SOCKET_NAME, FRAMES_SOCKET_NAME};

/// Ceiling on waiting for the slot region name after init.
const SHM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// Poll cadence while paused.
const PAUSE_POLL: Duration = Duration::from_millis(100);

pub fn run(args: &WorkerArgs) -> Result<()> {
  let kind: AnimatorKind = args.kind.parse().map_err(anyhow::Error::msg)?;
  let control_path = args.dir.join(CONTROL_SOCKET_NAME);
  let frames_path = args.dir.join(FRAMES_SOCKET_NAME);

  let mut endpoint = WorkerEndpoint::connect(&control_path)?;

  info!(event = "worker_loading", kind = %kind, source = %args.source.display());
  let animator = match animator::load(kind, &args.source) {
    Ok(animator) => {
      endpoint.send(&SessionBound::InitSuccess {
        skeleton: animator.skeleton().clone(),
        frame_size: animator.frame_size(),
      })?;
      animator
    }
    Err(err) => {
      let message = format!("{err:#}");
      error!(event = "worker_init_failed", error = %message);
      let _ = endpoint.send(&SessionBound::InitError {
        message: message.clone(),
      });
      bail!("animator init failed: {message}");
    }
  };

  let mut engine = Engine::new(animator, args);
  let Some(shm_path) = engine.await_shm(&mut endpoint)? else {
    info!(event = "worker_stopped_before_shm");
    return Ok(());
  };

  let slots = SlotWriter::open(&shm_path, args.buffers, engine.frame_size)?;
  let ready = ReadySender::connect(&frames_path)
    .with_context(|| format!("connect frame socket {}", frames_path.display()))?;

  info!(event = "worker_running", shm = %shm_path.display(), buffers = args.buffers);
  engine.run_loop(&mut endpoint, slots, &ready)?;
  info!(event = "worker_stopped");
  Ok(())
}

/// The worker's command dispatcher and tick state, separated from process
/// plumbing so it stays unit-testable.
pub struct Engine {
  animator: Box<dyn Animator>,
  source: String,
  fps: f64,
  speed: f64,
  paused: bool,
  running: bool,
  buffers: usize,
  frame_size: usize,
  shm_path: Option<PathBuf>,
}

impl Engine {
  pub fn new(animator: Box<dyn Animator>, args: &WorkerArgs) -> Self {
    let frame_size = animator.frame_size();
    Self {
      animator,
      source: args.source.display().to_string(),
      fps: args.fps,
      speed: 1.0,
      paused: false,
      running: true,
      buffers: args.buffers,
      frame_size,
      shm_path: None,
    }
  }

  /// Block until the session names the slot region. `Ok(None)` means a stop
  /// arrived first and the worker should exit cleanly.
  fn await_shm(&mut self, endpoint: &mut WorkerEndpoint) -> Result<Option<PathBuf>> {
    let deadline = Instant::now() + SHM_HANDSHAKE_TIMEOUT;
    loop {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        bail!("timed out waiting for the slot region name");
      }
      match endpoint.commands.recv_timeout(remaining) {
        Ok(WorkerBound::Command {
          name,
          args,
          expect_reply,
        }) => match name.as_str() {
          "set_shm" => {
            let path = args
              .as_str()
              .map(PathBuf::from)
              .context("set_shm expects a path string")?;
            self.shm_path = Some(path.clone());
            return Ok(Some(path));
          }
          "stop" => return Ok(None),
          other => {
            debug!(event = "worker_command_before_shm", command = other);
            if expect_reply {
              endpoint.reply(Value::Null, Some("worker is not running yet".to_string()))?;
            }
          }
        },
        Err(RecvTimeoutError::Timeout) => bail!("timed out waiting for the slot region name"),
        Err(RecvTimeoutError::Disconnected) => bail!("control channel closed during handshake"),
      }
    }
  }

  fn run_loop(
    &mut self,
    endpoint: &mut WorkerEndpoint,
    mut slots: SlotWriter,
    ready: &ReadySender,
  ) -> Result<()> {
    let mut slot = 0usize;
    while self.running {
      let tick_started = Instant::now();

      self.drain_commands(endpoint);
      if !self.running {
        break;
      }
      if self.paused {
        std::thread::sleep(PAUSE_POLL);
        continue;
      }

      let dt = 1.0 / self.fps;
      if let Err(err) = self
        .animator
        .write_frame(slots.slot_mut(slot), dt, self.speed)
      {
        // Unrecoverable: drop the mapping (never the file) and die.
        error!(event = "worker_frame_failed", error = %format!("{err:#}"));
        drop(slots);
        return Err(err);
      }
      if !ready.announce(slot as u8) {
        debug!(event = "frame_announcement_dropped", slot);
      }
      slot = (slot + 1) % self.buffers;

      let budget = Duration::from_secs_f64(dt);
      let elapsed = tick_started.elapsed();
      if elapsed < budget {
        std::thread::sleep(budget - elapsed);
      }
    }
    Ok(())
  }

  fn drain_commands(&mut self, endpoint: &mut WorkerEndpoint) {
    loop {
      match endpoint.commands.try_recv() {
        Ok(WorkerBound::Command {
          name,
          args,
          expect_reply,
        }) => {
          let outcome = self.handle(&name, &args);
          if let Err(message) = &outcome {
            warn!(event = "worker_command_failed", command = %name, error = %message);
          }
          if expect_reply {
            let (result, error) = match outcome {
              Ok(result) => (result, None),
              Err(message) => (Value::Null, Some(message)),
            };
            if endpoint.reply(result, error).is_err() {
              // Peer is gone; treat like a stop.
              self.running = false;
              return;
            }
          }
        }
        Err(TryRecvError::Empty) => return,
        Err(TryRecvError::Disconnected) => {
          self.running = false;
          return;
        }
      }
    }
  }

  /// Execute one command: system commands first, then the animator's
  /// operation table. Failures come back as the reply's error string and
  /// never tear the worker down.
  pub fn handle(&mut self, name: &str, args: &Value) -> Result<Value, String> {
    let args = CommandArgs(args);
    match name {
      "set_fps" => {
        let fps = args.one_f64()?;
        if fps <= 0.0 {
          return Err(format!("fps must be positive, got {fps}"));
        }
        self.fps = fps;
        Ok(json!(self.fps))
      }
      "set_speed" => {
        self.speed = args.one_f64()?;
        Ok(json!(self.speed))
      }
      "seek" => {
        let seconds = args.one_f64()?;
        if self.animator.seek(seconds) {
          Ok(json!("ok"))
        } else {
          Err("animator does not support seek".to_string())
        }
      }
      "get_info" => {
        let mut info = json!({
          "source": self.source,
          "fps": self.fps,
          "speed": self.speed,
          "shm": self.shm_path.as_ref().map(|p| p.display().to_string()),
          "frame_size": self.frame_size,
        });
        if let Some(time) = self.animator.current_time() {
          info["time"] = json!(time);
        }
        Ok(info)
      }
      "pause" => {
        self.paused = true;
        Ok(Value::Null)
      }
      "play" => {
        self.paused = false;
        Ok(Value::Null)
      }
      "stop" => {
        self.running = false;
        Ok(Value::Null)
      }
      "set_shm" => Err("slot region is already configured".to_string()),
      other => match self.animator.invoke(other, args) {
        Invoke::Done(outcome) => outcome,
        Invoke::NotExposed => Err(format!("method '{other}' exists but is not exposed")),
        Invoke::Unknown => Err(format!("unknown command: {other}")),
      },
    }
  }
}
