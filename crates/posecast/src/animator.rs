//! Animator adapters: the contract each concrete pose generator implements
//! and the factory resolving a session kind to a loaded animator.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::skeleton::SkeletonDef;

pub mod bvh;
pub mod vae;

/// Concrete pose generators selectable at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnimatorKind {
  Fk,
  Vae,
}

impl FromStr for AnimatorKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "FK" => Ok(Self::Fk),
      "VAE" => Ok(Self::Vae),
      other => Err(format!("unknown session type: {other}")),
    }
  }
}

impl fmt::Display for AnimatorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Fk => write!(f, "FK"),
      Self::Vae => write!(f, "VAE"),
    }
  }
}

/// Outcome of routing a command name through an animator's operation table.
#[derive(Debug)]
pub enum Invoke {
  /// The operation ran; its result or failure message.
  Done(Result<Value, String>),
  /// The operation exists but is not externally callable.
  NotExposed,
  /// No such operation.
  Unknown,
}

/// Command arguments as received over the control channel. A scalar carries
/// one value, a sequence carries positional values, a single-entry mapping
/// carries one named value, and null carries nothing.
#[derive(Debug, Clone, Copy)]
pub struct CommandArgs<'a>(pub &'a Value);

impl CommandArgs<'_> {
  fn single(&self) -> Option<&Value> {
    match self.0 {
      Value::Array(items) if items.len() == 1 => Some(&items[0]),
      Value::Object(map) if map.len() == 1 => map.values().next(),
      Value::Null => None,
      other => Some(other),
    }
  }

  pub fn one_f64(&self) -> Result<f64, String> {
    self
      .single()
      .and_then(Value::as_f64)
      .filter(|v| v.is_finite())
      .ok_or_else(|| format!("expected one finite number, got {}", self.0))
  }

  pub fn one_bool(&self) -> Result<bool, String> {
    self
      .single()
      .and_then(Value::as_bool)
      .ok_or_else(|| format!("expected one boolean, got {}", self.0))
  }

  pub fn f64_list(&self, expected: usize) -> Result<Vec<f64>, String> {
    let items = match self.0 {
      Value::Array(items) => items,
      Value::Object(map) if map.len() == 1 => match map.values().next() {
        Some(Value::Array(items)) => items,
        _ => return Err(format!("expected a list of {expected} numbers")),
      },
      _ => return Err(format!("expected a list of {expected} numbers")),
    };
    if items.len() != expected {
      return Err(format!(
        "expected {expected} numbers, got {}",
        items.len()
      ));
    }
    items
      .iter()
      .map(|v| {
        v.as_f64()
          .filter(|f| f.is_finite())
          .ok_or_else(|| format!("expected {expected} finite numbers"))
      })
      .collect()
  }
}

/// Contract implemented by each concrete pose generator.
///
/// Loading happens in the concrete constructors (may read disk and take
/// seconds); after that the worker only sees this interface.
pub trait Animator: Send {
  fn skeleton(&self) -> &SkeletonDef;

  /// Byte size of one frame: `bones * 16 * 8`.
  fn frame_size(&self) -> usize;

  /// Advance internal time by `dt * speed` and write the pose into `slot`
  /// (`frame_size` bytes, row-major `f64` world matrices). Ordinary time
  /// overflow must not fail; looping is the animator's concern.
  fn write_frame(&mut self, slot: &mut [u8], dt: f64, speed: f64) -> anyhow::Result<()>;

  /// Jump the internal clock. Returns false when unsupported.
  fn seek(&mut self, _seconds: f64) -> bool {
    false
  }

  fn current_time(&self) -> Option<f64> {
    None
  }

  /// Route a non-system command through the operation table.
  fn invoke(&mut self, _name: &str, _args: CommandArgs<'_>) -> Invoke {
    Invoke::Unknown
  }
}

/// Load the animator for `kind` from `source`.
pub fn load(kind: AnimatorKind, source: &Path) -> anyhow::Result<Box<dyn Animator>> {
  match kind {
    AnimatorKind::Fk => Ok(Box::new(bvh::FkAnimator::load(source)?)),
    AnimatorKind::Vae => Ok(Box::new(vae::VaeAnimator::load(source)?)),
  }
}
