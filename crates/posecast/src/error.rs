use thiserror::Error;

/// Failures of one running session, as seen by the front end.
#[derive(Debug, Error)]
pub enum SessionError {
  /// The worker failed to load its animation; carries the worker's message.
  #[error("session init failed: {0}")]
  Init(String),
  #[error("worker handshake timed out")]
  HandshakeTimeout,
  #[error("command dispatch timed out")]
  DispatchTimeout,
  /// The command channel closed unexpectedly; the worker most likely died.
  #[error("worker command channel closed")]
  BrokenChannel,
  /// The worker executed the command and reported a failure.
  #[error("{0}")]
  Engine(String),
  #[error("session is not running")]
  NotStarted,
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl SessionError {
  /// Classify a command-channel IO failure.
  pub(crate) fn from_channel_io(err: std::io::Error) -> Self {
    use std::io::ErrorKind;
    match err.kind() {
      ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
        Self::BrokenChannel
      }
      _ => Self::Io(err),
    }
  }
}

/// Failures of registry-level operations.
#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("session {0} already exists")]
  Conflict(String),
  #[error("session {0} not found")]
  NotFound(String),
  #[error(transparent)]
  Session(#[from] SessionError),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}
