//! Cross-process frame transport for one session.
//!
//! Three independent primitives live in a session's runtime directory and
//! are bound only by naming convention:
//! - [`slots`]: the memory-mapped slot region the worker writes pose frames
//!   into and the broadcaster reads from,
//! - [`frames`]: the bounded, lossy ready-index channel announcing which
//!   slot just became readable,
//! - [`control`]: the framed duplex command channel between session front
//!   end and worker.
//!
//! None of this knows anything about animation.

pub mod control;
pub mod frames;
pub mod slots;

/// Stream socket carrying framed control messages.
pub const CONTROL_SOCKET_NAME: &str = "control.sock";
/// Datagram socket carrying slot announcements.
pub const FRAMES_SOCKET_NAME: &str = "frames.sock";
/// Memory-mapped slot region, sized `buffer_count * frame_size`.
pub const SLOTS_FILE_NAME: &str = "slots.mem";
