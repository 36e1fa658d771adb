//! Framed duplex command channel between session front end and worker.
//!
//! Frames are length-prefixed (little-endian `u32` header) JSON payloads;
//! JSON because command arguments are arbitrary client-supplied values. The
//! worker side is synchronous (a reader thread feeds the tick loop), the
//! session side is async.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::mpsc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::skeleton::SkeletonDef;

/// Number of bytes in the frame header (little-endian `u32`).
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on one frame; anything larger means a corrupt header.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Messages sent from the session front end to the worker.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerBound {
  /// A control command: system commands and animator operations alike.
  Command {
    name: String,
    args: Value,
    expect_reply: bool,
  },
}

/// Messages sent from the worker to the session front end.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionBound {
  /// The animator loaded; the session can now size the slot region.
  InitSuccess {
    skeleton: SkeletonDef,
    frame_size: usize,
  },
  /// The animator failed to load; the worker exits after sending this.
  InitError { message: String },
  /// Reply to a `Command` with `expect_reply`.
  Reply {
    result: Value,
    error: Option<String>,
  },
}

/// Writes one framed payload to the given writer.
pub fn write_message<W: Write, T: Serialize>(mut writer: W, payload: &T) -> Result<()> {
  let data = serde_json::to_vec(payload).context("encode control frame")?;
  let hdr = (data.len() as u32).to_le_bytes();
  writer.write_all(&hdr).context("write frame header (len)")?;
  writer.write_all(&data).context("write frame payload bytes")?;
  Ok(())
}

/// Reads one framed payload from the given reader.
pub fn read_message<R: Read, T: DeserializeOwned>(mut reader: R) -> Result<T> {
  let mut hdr = [0u8; FRAME_HEADER_LEN];
  reader.read_exact(&mut hdr).context("read frame header (len)")?;
  let len = u32::from_le_bytes(hdr) as usize;
  anyhow::ensure!(len <= MAX_FRAME_BYTES, "control frame of {len} bytes");
  let mut buf = vec![0u8; len];
  reader.read_exact(&mut buf).context("read frame payload bytes")?;
  serde_json::from_slice(&buf).context("decode control frame")
}

async fn send_frame<T: Serialize>(
  stream: &mut tokio::net::UnixStream,
  payload: &T,
) -> std::io::Result<()> {
  let data = serde_json::to_vec(payload).map_err(std::io::Error::other)?;
  let hdr = (data.len() as u32).to_le_bytes();
  stream.write_all(&hdr).await?;
  stream.write_all(&data).await?;
  Ok(())
}

async fn recv_frame<T: DeserializeOwned>(
  stream: &mut tokio::net::UnixStream,
) -> std::io::Result<T> {
  let mut hdr = [0u8; FRAME_HEADER_LEN];
  stream.read_exact(&mut hdr).await?;
  let len = u32::from_le_bytes(hdr) as usize;
  if len > MAX_FRAME_BYTES {
    return Err(std::io::Error::other(format!("control frame of {len} bytes")));
  }
  let mut buf = vec![0u8; len];
  stream.read_exact(&mut buf).await?;
  serde_json::from_slice(&buf).map_err(std::io::Error::other)
}

/// Session-side endpoint of the command channel.
///
/// Not internally locked; the session serializes access through its command
/// lock. `stale_replies` counts replies orphaned by dispatch timeouts so the
/// next waiting dispatch can flush them and keep request/reply pairing.
pub struct ControlConn {
  stream: tokio::net::UnixStream,
  pub stale_replies: u32,
}

impl ControlConn {
  pub fn new(stream: tokio::net::UnixStream) -> Self {
    Self {
      stream,
      stale_replies: 0,
    }
  }

  pub async fn send(&mut self, message: &WorkerBound) -> std::io::Result<()> {
    send_frame(&mut self.stream, message).await
  }

  pub async fn recv(&mut self) -> std::io::Result<SessionBound> {
    recv_frame(&mut self.stream).await
  }
}

/// Worker-side endpoint: a reader thread decodes incoming commands into a
/// channel the tick loop drains without blocking; replies go out over the
/// same stream from the tick loop only.
pub struct WorkerEndpoint {
  pub commands: mpsc::Receiver<WorkerBound>,
  writer: std::os::unix::net::UnixStream,
}

impl WorkerEndpoint {
  pub fn connect(path: &Path) -> Result<Self> {
    let reader = std::os::unix::net::UnixStream::connect(path)
      .with_context(|| format!("connect control socket {}", path.display()))?;
    let writer = reader.try_clone().context("clone control stream")?;
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
      .name("control-reader".to_string())
      .spawn(move || {
        let mut reader = reader;
        loop {
          match read_message::<_, WorkerBound>(&mut reader) {
            Ok(message) => {
              if tx.send(message).is_err() {
                break;
              }
            }
            Err(err) => {
              debug!(event = "control_reader_closed", error = %err);
              break;
            }
          }
        }
      })
      .context("spawn control reader thread")?;
    Ok(Self { commands: rx, writer })
  }

  pub fn send(&mut self, message: &SessionBound) -> Result<()> {
    write_message(&mut self.writer, message)
  }

  pub fn reply(&mut self, result: Value, error: Option<String>) -> Result<()> {
    self.send(&SessionBound::Reply { result, error })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  #[test]
  fn frames_round_trip_over_a_socket_pair() {
    let (mut a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
    let sent = WorkerBound::Command {
      name: "set_speed".into(),
      args: json!(2.0),
      expect_reply: true,
    };
    write_message(&mut a, &sent).unwrap();
    let WorkerBound::Command {
      name,
      args,
      expect_reply,
    } = read_message(&mut b).unwrap();
    assert_eq!(name, "set_speed");
    assert_eq!(args, json!(2.0));
    assert!(expect_reply);

    write_message(
      &mut b,
      &SessionBound::Reply {
        result: json!(2.0),
        error: None,
      },
    )
    .unwrap();
    match read_message::<_, SessionBound>(&mut a).unwrap() {
      SessionBound::Reply { result, error } => {
        assert_eq!(result, json!(2.0));
        assert_eq!(error, None);
      }
      other => panic!("unexpected frame: {other:?}"),
    }
  }

  #[test]
  fn oversized_headers_are_rejected() {
    let (mut a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
    let hdr = (MAX_FRAME_BYTES as u32 + 1).to_le_bytes();
    use std::io::Write as _;
    a.write_all(&hdr).unwrap();
    let err = read_message::<_, SessionBound>(&mut b).unwrap_err();
    assert!(err.to_string().contains("control frame"));
  }

  #[test]
  fn worker_endpoint_decodes_commands_and_replies() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("control.sock");
    let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

    let mut endpoint = WorkerEndpoint::connect(&path).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    write_message(
      &mut peer,
      &WorkerBound::Command {
        name: "get_info".into(),
        args: Value::Null,
        expect_reply: true,
      },
    )
    .unwrap();
    let WorkerBound::Command { name, .. } = endpoint
      .commands
      .recv_timeout(std::time::Duration::from_secs(2))
      .unwrap();
    assert_eq!(name, "get_info");

    endpoint.reply(json!({"fps": 60.0}), None).unwrap();
    match read_message::<_, SessionBound>(&mut peer).unwrap() {
      SessionBound::Reply { result, .. } => assert_eq!(result["fps"], 60.0),
      other => panic!("unexpected frame: {other:?}"),
    }
  }
}
