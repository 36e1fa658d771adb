//! Ready-index channel: the worker announces freshly written slots, the
//! broadcaster consumes them. Bounded and lossy by design; when a consumer
//! lags, announcements are dropped, never blocked on.

use std::io::ErrorKind;
use std::path::Path;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Consumer side: owns the bound datagram socket.
pub struct ReadyListener {
  socket: tokio::net::UnixDatagram,
}

impl ReadyListener {
  pub fn bind(path: &Path) -> std::io::Result<Self> {
    Ok(Self {
      socket: tokio::net::UnixDatagram::bind(path)?,
    })
  }

  /// Spawn the forwarding task bridging the socket into a bounded channel
  /// of `capacity` slot indices. Indices past capacity are dropped, which
  /// makes the in-process channel the single backpressure point.
  pub fn forward(self, capacity: usize) -> (mpsc::Receiver<u8>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let task = tokio::spawn(async move {
      let mut buf = [0u8; 16];
      loop {
        match self.socket.recv_from(&mut buf).await {
          Ok((n, _)) if n >= 1 => match tx.try_send(buf[0]) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(slot)) => {
              trace!(event = "ready_index_dropped", slot);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
          },
          Ok(_) => {}
          Err(err) => {
            debug!(event = "ready_socket_closed", error = %err);
            break;
          }
        }
      }
    });
    (rx, task)
  }
}

/// Producer side: non-blocking announcements from the worker process.
pub struct ReadySender {
  socket: std::os::unix::net::UnixDatagram,
}

impl ReadySender {
  pub fn connect(path: &Path) -> std::io::Result<Self> {
    let socket = std::os::unix::net::UnixDatagram::unbound()?;
    socket.connect(path)?;
    socket.set_nonblocking(true)?;
    Ok(Self { socket })
  }

  /// Offer a slot index. Returns false when the channel is full (or gone)
  /// and the announcement was dropped.
  pub fn announce(&self, slot: u8) -> bool {
    match self.socket.send(&[slot]) {
      Ok(_) => true,
      Err(err) if err.kind() == ErrorKind::WouldBlock => false,
      Err(err) => {
        trace!(event = "ready_announce_failed", error = %err);
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn announcements_arrive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.sock");
    let listener = ReadyListener::bind(&path).unwrap();
    let sender = ReadySender::connect(&path).unwrap();

    for slot in [0u8, 1, 2, 0] {
      assert!(sender.announce(slot));
    }

    let (mut rx, task) = listener.forward(8);
    let mut seen = Vec::new();
    for _ in 0..4 {
      let slot = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
      seen.push(slot);
    }
    assert_eq!(seen, vec![0, 1, 2, 0]);

    drop(rx);
    // Forwarder ends once the consumer is gone and another datagram arrives.
    sender.announce(1);
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
  }

  #[tokio::test]
  async fn sender_survives_a_missing_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.sock");
    let listener = ReadyListener::bind(&path).unwrap();
    let sender = ReadySender::connect(&path).unwrap();
    drop(listener);
    // Dropped, not an error path that panics.
    let _ = sender.announce(0);
  }
}
