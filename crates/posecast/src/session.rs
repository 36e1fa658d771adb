//! One session: a worker process, its frame transport, the subscriber set,
//! and the broadcaster fanning frames out to every subscriber.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::animator::AnimatorKind;
use crate::error::SessionError;
use crate::skeleton::SkeletonDef;
use crate::transport::control::{ControlConn, SessionBound, WorkerBound};
use crate::transport::frames::ReadyListener;
use crate::transport::slots::{self, SlotReader};
use crate::transport::{CONTROL_SOCKET_NAME, FRAMES_SOCKET_NAME, SLOTS_FILE_NAME};

pub mod registry;

/// Ceiling on the worker loading its animation and reporting in.
const INIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period before a stopping worker is killed.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// How long `stop` waits for the command lock before giving up on a
/// best-effort stop command.
const STOP_LOCK_TIMEOUT: Duration = Duration::from_millis(500);
/// Default ceiling on awaiting a command reply.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(2);
/// Outbound frames buffered per subscriber before its copies get dropped.
const SUBSCRIBER_QUEUE: usize = 8;

/// Knobs shared by every session a registry creates.
#[derive(Debug, Clone)]
pub struct SessionOptions {
  pub buffer_count: usize,
  pub fps: f64,
  /// Worker binary override; defaults to the current executable.
  pub worker_bin: Option<PathBuf>,
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self {
      buffer_count: 3,
      fps: 60.0,
      worker_bin: None,
    }
  }
}

/// One attached subscriber's receiving half. Dropping it detaches lazily;
/// callers should still call [`Session::detach`] with the id.
pub struct Subscriber {
  pub id: u64,
  pub frames: mpsc::Receiver<Bytes>,
}

struct StartedState {
  skeleton: SkeletonDef,
  frame_size: usize,
  slots_path: PathBuf,
}

type SubscriberMap = Arc<StdMutex<HashMap<u64, mpsc::Sender<Bytes>>>>;

/// Lifecycle owner for one animation instance.
///
/// The command channel is guarded by an async lock so concurrent HTTP
/// handlers keep strict request/reply pairing; control commands are thereby
/// totally ordered per session.
pub struct Session {
  id: String,
  kind: AnimatorKind,
  source: PathBuf,
  opts: SessionOptions,
  runtime_dir: TempDir,
  control: Mutex<Option<ControlConn>>,
  worker: Mutex<Option<tokio::process::Child>>,
  subscribers: SubscriberMap,
  next_subscriber_id: AtomicU64,
  started: OnceLock<StartedState>,
  tasks: StdMutex<Vec<JoinHandle<()>>>,
  stopped: AtomicBool,
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("id", &self.id)
      .field("kind", &self.kind)
      .field("source", &self.source)
      .field("stopped", &self.stopped.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

impl Session {
  pub fn new(
    id: impl Into<String>,
    kind: AnimatorKind,
    source: PathBuf,
    opts: SessionOptions,
  ) -> std::io::Result<Self> {
    let runtime_dir = tempfile::Builder::new().prefix("posecast-").tempdir()?;
    Ok(Self {
      id: id.into(),
      kind,
      source,
      opts,
      runtime_dir,
      control: Mutex::new(None),
      worker: Mutex::new(None),
      subscribers: Arc::new(StdMutex::new(HashMap::new())),
      next_subscriber_id: AtomicU64::new(1),
      started: OnceLock::new(),
      tasks: StdMutex::new(Vec::new()),
      stopped: AtomicBool::new(false),
    })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn kind(&self) -> AnimatorKind {
    self.kind
  }

  pub fn runtime_dir(&self) -> &Path {
    self.runtime_dir.path()
  }

  /// Skeleton reported by the worker; `None` until `start` succeeded.
  pub fn skeleton(&self) -> Option<&SkeletonDef> {
    self.started.get().map(|s| &s.skeleton)
  }

  pub fn frame_size(&self) -> Option<usize> {
    self.started.get().map(|s| s.frame_size)
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers.lock().unwrap().len()
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::SeqCst)
  }

  /// Spawn the worker and run the two-phase handshake: await init metadata,
  /// size and create the slot region, hand its name to the worker, then
  /// launch the broadcaster.
  pub async fn start(&self) -> Result<(), SessionError> {
    if self.started.get().is_some() {
      return Err(SessionError::Init("session already started".to_string()));
    }
    let control_path = self.runtime_dir.path().join(CONTROL_SOCKET_NAME);
    let frames_path = self.runtime_dir.path().join(FRAMES_SOCKET_NAME);
    let listener = tokio::net::UnixListener::bind(&control_path)?;
    let ready = ReadyListener::bind(&frames_path)?;

    let mut child = self.spawn_worker()?;
    info!(
      event = "session_worker_spawned",
      session_id = %self.id,
      kind = %self.kind,
      source = %self.source.display(),
    );

    match self.finish_start(&listener, ready).await {
      Ok(()) => {
        *self.worker.lock().await = Some(child);
        info!(
          event = "session_started",
          session_id = %self.id,
          frame_size = self.frame_size().unwrap_or(0),
          buffers = self.opts.buffer_count,
        );
        Ok(())
      }
      Err(err) => {
        warn!(event = "session_start_failed", session_id = %self.id, error = %err);
        let _ = child.start_kill();
        let _ = child.wait().await;
        Err(err)
      }
    }
  }

  async fn finish_start(
    &self,
    listener: &tokio::net::UnixListener,
    ready: ReadyListener,
  ) -> Result<(), SessionError> {
    let handshake = async {
      let (stream, _) = listener.accept().await?;
      let mut conn = ControlConn::new(stream);
      let first = conn.recv().await?;
      std::io::Result::Ok((conn, first))
    };
    let (mut conn, first) = match timeout(INIT_TIMEOUT, handshake).await {
      Ok(Ok(pair)) => pair,
      Ok(Err(err)) => return Err(SessionError::Init(err.to_string())),
      Err(_) => return Err(SessionError::HandshakeTimeout),
    };

    let (skeleton, frame_size) = match first {
      SessionBound::InitSuccess {
        skeleton,
        frame_size,
      } => (skeleton, frame_size),
      SessionBound::InitError { message } => return Err(SessionError::Init(message)),
      SessionBound::Reply { .. } => {
        return Err(SessionError::Init("unexpected reply during handshake".to_string()));
      }
    };
    skeleton
      .validate()
      .map_err(|err| SessionError::Init(err.to_string()))?;
    if frame_size != skeleton.frame_size() {
      return Err(SessionError::Init(format!(
        "worker reported frame size {frame_size}, skeleton needs {}",
        skeleton.frame_size()
      )));
    }

    let slots_path = self.runtime_dir.path().join(SLOTS_FILE_NAME);
    let slots = SlotReader::create(&slots_path, self.opts.buffer_count, frame_size)
      .map_err(|err| SessionError::Init(format!("{err:#}")))?;

    conn
      .send(&WorkerBound::Command {
        name: "set_shm".to_string(),
        args: json!(slots_path),
        expect_reply: false,
      })
      .await
      .map_err(SessionError::from_channel_io)?;

    let (frames_rx, forward_task) = ready.forward(self.opts.buffer_count);
    let broadcaster = tokio::spawn(broadcast_loop(
      self.id.clone(),
      slots,
      frames_rx,
      Arc::clone(&self.subscribers),
    ));
    self
      .tasks
      .lock()
      .unwrap()
      .extend([forward_task, broadcaster]);
    *self.control.lock().await = Some(conn);
    let _ = self.started.set(StartedState {
      skeleton,
      frame_size,
      slots_path,
    });
    Ok(())
  }

  fn spawn_worker(&self) -> std::io::Result<tokio::process::Child> {
    let bin = self
      .opts
      .worker_bin
      .clone()
      .or_else(|| std::env::var_os("POSECAST_WORKER_BIN").map(PathBuf::from))
      .map_or_else(std::env::current_exe, Ok)?;
    let mut cmd = tokio::process::Command::new(bin);
    cmd
      .arg("worker")
      .arg("--kind")
      .arg(self.kind.to_string())
      .arg("--source")
      .arg(&self.source)
      .arg("--dir")
      .arg(self.runtime_dir.path())
      .arg("--fps")
      .arg(self.opts.fps.to_string())
      .arg("--buffers")
      .arg(self.opts.buffer_count.to_string())
      .stdin(std::process::Stdio::null())
      .kill_on_drop(true);
    cmd.spawn()
  }

  /// Send one command to the worker under the session's command lock.
  ///
  /// With `wait` the reply is awaited up to `reply_timeout`; a timeout
  /// releases the lock but leaves the reply owed, and the next waiting
  /// dispatch flushes it so no reply is ever paired with the wrong caller.
  pub async fn dispatch(
    &self,
    name: &str,
    args: Value,
    wait: bool,
    reply_timeout: Duration,
  ) -> Result<Value, SessionError> {
    if self.is_stopped() {
      return Err(SessionError::NotStarted);
    }
    let mut guard = self.control.lock().await;
    let conn = guard.as_mut().ok_or(SessionError::NotStarted)?;

    while conn.stale_replies > 0 {
      match timeout(reply_timeout, conn.recv()).await {
        Ok(Ok(SessionBound::Reply { .. })) => conn.stale_replies -= 1,
        Ok(Ok(_)) => {}
        Ok(Err(err)) => return Err(SessionError::from_channel_io(err)),
        Err(_) => return Err(SessionError::DispatchTimeout),
      }
    }

    conn
      .send(&WorkerBound::Command {
        name: name.to_string(),
        args,
        expect_reply: wait,
      })
      .await
      .map_err(SessionError::from_channel_io)?;
    if !wait {
      return Ok(Value::Null);
    }

    match timeout(reply_timeout, conn.recv()).await {
      Ok(Ok(SessionBound::Reply { result, error })) => match error {
        Some(message) => Err(SessionError::Engine(message)),
        None => Ok(result),
      },
      Ok(Ok(_)) => Err(SessionError::Engine(
        "unexpected frame from worker".to_string(),
      )),
      Ok(Err(err)) => Err(SessionError::from_channel_io(err)),
      Err(_) => {
        conn.stale_replies += 1;
        Err(SessionError::DispatchTimeout)
      }
    }
  }

  pub async fn get_info(&self) -> Result<Value, SessionError> {
    self
      .dispatch("get_info", Value::Null, true, DEFAULT_DISPATCH_TIMEOUT)
      .await
  }

  pub async fn set_speed(&self, speed: f64) -> Result<(), SessionError> {
    self
      .dispatch("set_speed", json!(speed), true, DEFAULT_DISPATCH_TIMEOUT)
      .await?;
    info!(event = "session_speed_set", session_id = %self.id, speed);
    Ok(())
  }

  pub async fn set_fps(&self, fps: f64) -> Result<(), SessionError> {
    self
      .dispatch("set_fps", json!(fps), true, DEFAULT_DISPATCH_TIMEOUT)
      .await?;
    info!(event = "session_fps_set", session_id = %self.id, fps);
    Ok(())
  }

  pub async fn set_vae_values(&self, values: &[f64]) -> Result<(), SessionError> {
    self
      .dispatch(
        "set_vae_values",
        json!(values),
        true,
        DEFAULT_DISPATCH_TIMEOUT,
      )
      .await?;
    info!(event = "session_vae_values_set", session_id = %self.id, ?values);
    Ok(())
  }

  /// Pause frame production. One-way; the worker honors it within a tick.
  pub async fn pause(&self) -> Result<(), SessionError> {
    self
      .dispatch("pause", Value::Null, false, DEFAULT_DISPATCH_TIMEOUT)
      .await?;
    info!(event = "session_paused", session_id = %self.id);
    Ok(())
  }

  pub async fn play(&self) -> Result<(), SessionError> {
    self
      .dispatch("play", Value::Null, false, DEFAULT_DISPATCH_TIMEOUT)
      .await?;
    info!(event = "session_playing", session_id = %self.id);
    Ok(())
  }

  /// Attach a new subscriber and hand back its frame stream.
  pub fn attach(&self) -> Result<Subscriber, SessionError> {
    if self.is_stopped() || self.started.get().is_none() {
      return Err(SessionError::NotStarted);
    }
    let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
    self.subscribers.lock().unwrap().insert(id, tx);
    info!(event = "subscriber_attached", session_id = %self.id, subscriber = id);
    Ok(Subscriber { id, frames: rx })
  }

  /// Detach a subscriber. Idempotent.
  pub fn detach(&self, id: u64) {
    if self.subscribers.lock().unwrap().remove(&id).is_some() {
      debug!(event = "subscriber_detached", session_id = %self.id, subscriber = id);
    }
  }

  /// Tear the session down: cancel the broadcaster, stop the worker (kill
  /// after a grace period), drop every subscriber, and unlink the slot
  /// region. Idempotent.
  pub async fn stop(&self) {
    if self.stopped.swap(true, Ordering::SeqCst) {
      return;
    }
    info!(event = "session_stopping", session_id = %self.id);

    for task in self.tasks.lock().unwrap().drain(..) {
      task.abort();
    }

    // Best-effort stop command; a hung dispatch holding the lock must not
    // stall teardown.
    if let Ok(mut guard) = timeout(STOP_LOCK_TIMEOUT, self.control.lock()).await {
      if let Some(conn) = guard.as_mut() {
        let stop = WorkerBound::Command {
          name: "stop".to_string(),
          args: Value::Null,
          expect_reply: false,
        };
        let _ = timeout(STOP_LOCK_TIMEOUT, conn.send(&stop)).await;
      }
      // Dropping the connection doubles as a stop signal for the worker.
      *guard = None;
    }

    if let Some(mut child) = self.worker.lock().await.take() {
      match timeout(STOP_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
          warn!(event = "session_worker_killed", session_id = %self.id);
          let _ = child.start_kill();
          let _ = child.wait().await;
        }
      }
    }

    self.subscribers.lock().unwrap().clear();

    if let Some(state) = self.started.get()
      && let Err(err) = slots::unlink(&state.slots_path)
    {
      warn!(event = "slot_region_unlink_failed", session_id = %self.id, error = %err);
    }
    info!(event = "session_stopped", session_id = %self.id);
  }
}

/// Await ready slot indices and fan each frame out to every subscriber.
///
/// A lagging subscriber loses its copy of the frame; a closed one is
/// detached. Neither disturbs the other subscribers or the loop.
async fn broadcast_loop(
  session_id: String,
  slots: SlotReader,
  mut frames: mpsc::Receiver<u8>,
  subscribers: SubscriberMap,
) {
  while let Some(slot) = frames.recv().await {
    let slot = slot as usize;
    if slot >= slots.count() {
      warn!(event = "broadcast_bad_slot", session_id = %session_id, slot);
      continue;
    }
    let targets: Vec<(u64, mpsc::Sender<Bytes>)> = {
      let map = subscribers.lock().unwrap();
      map.iter().map(|(id, tx)| (*id, tx.clone())).collect()
    };
    if targets.is_empty() {
      continue;
    }

    let payload = Bytes::copy_from_slice(slots.slot(slot));
    let mut closed = Vec::new();
    for (id, tx) in &targets {
      match tx.try_send(payload.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
          debug!(event = "subscriber_lagging", session_id = %session_id, subscriber = id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
      }
    }
    if !closed.is_empty() {
      let mut map = subscribers.lock().unwrap();
      for id in closed {
        map.remove(&id);
        debug!(event = "subscriber_detached", session_id = %session_id, subscriber = id);
      }
    }
  }
  debug!(event = "broadcast_loop_ended", session_id = %session_id);
}
