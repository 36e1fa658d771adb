//! BVH document parsing and the forward-kinematics animator built on it.

use std::path::Path;

use anyhow::Context;
use serde_json::Value;
use thiserror::Error;

use crate::math::Mat4;
use crate::skeleton::{SkeletonDef, bind_pose_from_positions};

use super::{Animator, CommandArgs, Invoke};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BvhChannel {
  Xposition,
  Yposition,
  Zposition,
  Xrotation,
  Yrotation,
  Zrotation,
}

impl BvhChannel {
  fn parse(token: &str) -> Result<Self, BvhError> {
    match token {
      "Xposition" => Ok(Self::Xposition),
      "Yposition" => Ok(Self::Yposition),
      "Zposition" => Ok(Self::Zposition),
      "Xrotation" => Ok(Self::Xrotation),
      "Yrotation" => Ok(Self::Yrotation),
      "Zrotation" => Ok(Self::Zrotation),
      other => Err(BvhError::UnknownChannel(other.to_string())),
    }
  }
}

#[derive(Debug, Clone)]
pub struct BvhJoint {
  pub name: String,
  /// -1 for the root, otherwise an index of an earlier joint.
  pub parent: i32,
  pub offset: [f64; 3],
  pub channels: Vec<BvhChannel>,
  /// Index of this joint's first value inside a motion row.
  pub channel_base: usize,
}

/// Parsed BVH file: hierarchy plus flattened motion rows.
#[derive(Debug, Clone)]
pub struct BvhDocument {
  pub joints: Vec<BvhJoint>,
  pub frame_time: f64,
  pub channels_per_frame: usize,
  values: Vec<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum BvhError {
  #[error("expected {expected}, found {found}")]
  UnexpectedToken { expected: String, found: String },
  #[error("unexpected end of file")]
  UnexpectedEof,
  #[error("not a number: {0}")]
  BadNumber(String),
  #[error("unknown channel type: {0}")]
  UnknownChannel(String),
  #[error("invalid frame time {0}")]
  BadFrameTime(f64),
  #[error("file declares no motion frames")]
  NoFrames,
}

struct Tokens<'a> {
  iter: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
  fn next(&mut self) -> Result<&'a str, BvhError> {
    self.iter.next().ok_or(BvhError::UnexpectedEof)
  }

  fn expect(&mut self, expected: &str) -> Result<(), BvhError> {
    let found = self.next()?;
    if found == expected {
      Ok(())
    } else {
      Err(BvhError::UnexpectedToken {
        expected: expected.to_string(),
        found: found.to_string(),
      })
    }
  }

  fn number(&mut self) -> Result<f64, BvhError> {
    let token = self.next()?;
    token
      .parse::<f64>()
      .map_err(|_| BvhError::BadNumber(token.to_string()))
  }

  fn count(&mut self) -> Result<usize, BvhError> {
    let token = self.next()?;
    token
      .parse::<usize>()
      .map_err(|_| BvhError::BadNumber(token.to_string()))
  }
}

impl BvhDocument {
  pub fn parse(text: &str) -> Result<Self, BvhError> {
    let mut tokens = Tokens {
      iter: text.split_whitespace(),
    };
    tokens.expect("HIERARCHY")?;
    tokens.expect("ROOT")?;

    let mut joints: Vec<BvhJoint> = Vec::new();
    let mut channel_base = 0usize;
    parse_joint(&mut tokens, -1, &mut joints, &mut channel_base)?;

    tokens.expect("MOTION")?;
    tokens.expect("Frames:")?;
    let frame_count = tokens.count()?;
    if frame_count == 0 {
      return Err(BvhError::NoFrames);
    }
    tokens.expect("Frame")?;
    tokens.expect("Time:")?;
    let frame_time = tokens.number()?;
    if !frame_time.is_finite() || frame_time <= 0.0 {
      return Err(BvhError::BadFrameTime(frame_time));
    }

    let channels_per_frame = channel_base;
    let mut values = Vec::with_capacity(frame_count * channels_per_frame);
    for _ in 0..frame_count * channels_per_frame {
      values.push(tokens.number()?);
    }

    Ok(Self {
      joints,
      frame_time,
      channels_per_frame,
      values,
    })
  }

  pub fn frame_count(&self) -> usize {
    if self.channels_per_frame == 0 {
      0
    } else {
      self.values.len() / self.channels_per_frame
    }
  }

  pub fn duration(&self) -> f64 {
    self.frame_count() as f64 * self.frame_time
  }

  pub fn row(&self, frame: usize) -> &[f64] {
    let base = frame * self.channels_per_frame;
    &self.values[base..base + self.channels_per_frame]
  }
}

fn parse_joint(
  tokens: &mut Tokens<'_>,
  parent: i32,
  joints: &mut Vec<BvhJoint>,
  channel_base: &mut usize,
) -> Result<(), BvhError> {
  let name = tokens.next()?.to_string();
  tokens.expect("{")?;
  tokens.expect("OFFSET")?;
  let offset = [tokens.number()?, tokens.number()?, tokens.number()?];
  tokens.expect("CHANNELS")?;
  let channel_count = tokens.count()?;
  let mut channels = Vec::with_capacity(channel_count);
  for _ in 0..channel_count {
    channels.push(BvhChannel::parse(tokens.next()?)?);
  }

  let index = joints.len() as i32;
  joints.push(BvhJoint {
    name,
    parent,
    offset,
    channels,
    channel_base: *channel_base,
  });
  *channel_base += channel_count;

  loop {
    match tokens.next()? {
      "JOINT" => parse_joint(tokens, index, joints, channel_base)?,
      "End" => {
        // End Sites carry an offset but no channels and are not bones.
        tokens.expect("Site")?;
        tokens.expect("{")?;
        tokens.expect("OFFSET")?;
        for _ in 0..3 {
          tokens.number()?;
        }
        tokens.expect("}")?;
      }
      "}" => return Ok(()),
      found => {
        return Err(BvhError::UnexpectedToken {
          expected: "JOINT, End or }".to_string(),
          found: found.to_string(),
        });
      }
    }
  }
}

/// Plays back a BVH clip by solving forward kinematics over its hierarchy.
pub struct FkAnimator {
  doc: BvhDocument,
  skeleton: SkeletonDef,
  clock: f64,
  looping: bool,
}

impl FkAnimator {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let text = std::fs::read_to_string(path)
      .with_context(|| format!("read BVH file {}", path.display()))?;
    Self::from_text(&text)
      .with_context(|| format!("parse BVH file {}", path.display()))
  }

  pub fn from_text(text: &str) -> anyhow::Result<Self> {
    let doc = BvhDocument::parse(text)?;
    let names = doc.joints.iter().map(|j| j.name.clone()).collect();
    let parents = doc.joints.iter().map(|j| j.parent).collect();
    let positions = doc.joints.iter().map(|j| j.offset).collect();
    let skeleton = SkeletonDef::new(names, parents, bind_pose_from_positions(positions))?;
    Ok(Self {
      doc,
      skeleton,
      clock: 0.0,
      looping: true,
    })
  }

  /// Motion row active at the current clock. Looping wraps in both
  /// directions; otherwise the clip holds its first/last frame.
  fn active_row(&self) -> &[f64] {
    let duration = self.doc.duration();
    let t = if self.looping {
      self.clock.rem_euclid(duration)
    } else {
      self.clock.clamp(0.0, duration - self.doc.frame_time)
    };
    let frame = ((t / self.doc.frame_time) as usize).min(self.doc.frame_count() - 1);
    self.doc.row(frame)
  }

  fn local_matrix(joint: &BvhJoint, row: &[f64]) -> Mat4 {
    let mut translation = joint.offset;
    let mut rotation = Mat4::IDENTITY;
    for (i, channel) in joint.channels.iter().enumerate() {
      let value = row[joint.channel_base + i];
      match channel {
        BvhChannel::Xposition => translation[0] = joint.offset[0] + value,
        BvhChannel::Yposition => translation[1] = joint.offset[1] + value,
        BvhChannel::Zposition => translation[2] = joint.offset[2] + value,
        BvhChannel::Xrotation => rotation = rotation.mul(&Mat4::rot_x(value.to_radians())),
        BvhChannel::Yrotation => rotation = rotation.mul(&Mat4::rot_y(value.to_radians())),
        BvhChannel::Zrotation => rotation = rotation.mul(&Mat4::rot_z(value.to_radians())),
      }
    }
    Mat4::translation(translation).mul(&rotation)
  }
}

impl Animator for FkAnimator {
  fn skeleton(&self) -> &SkeletonDef {
    &self.skeleton
  }

  fn frame_size(&self) -> usize {
    self.skeleton.frame_size()
  }

  fn write_frame(&mut self, slot: &mut [u8], dt: f64, speed: f64) -> anyhow::Result<()> {
    self.clock += dt * speed;
    let row = self.active_row();
    let mut worlds: Vec<Mat4> = Vec::with_capacity(self.doc.joints.len());
    for (i, joint) in self.doc.joints.iter().enumerate() {
      let local = Self::local_matrix(joint, row);
      let world = if joint.parent < 0 {
        local
      } else {
        worlds[joint.parent as usize].mul(&local)
      };
      world.write_to(&mut slot[i * 128..(i + 1) * 128]);
      worlds.push(world);
    }
    Ok(())
  }

  fn seek(&mut self, seconds: f64) -> bool {
    self.clock = seconds;
    true
  }

  fn current_time(&self) -> Option<f64> {
    Some(self.clock)
  }

  fn invoke(&mut self, name: &str, args: CommandArgs<'_>) -> Invoke {
    match name {
      "set_loop" => Invoke::Done(args.one_bool().map(|looping| {
        self.looping = looping;
        Value::Bool(looping)
      })),
      _ => Invoke::Unknown,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  pub const SIMPLE_BVH: &str = "\
HIERARCHY
ROOT Hips
{
  OFFSET 0.0 1.0 0.0
  CHANNELS 6 Xposition Yposition Zposition Zrotation Xrotation Yrotation
  JOINT Spine
  {
    OFFSET 0.0 0.5 0.0
    CHANNELS 3 Zrotation Xrotation Yrotation
    JOINT Head
    {
      OFFSET 0.0 0.25 0.0
      CHANNELS 3 Zrotation Xrotation Yrotation
      End Site
      {
        OFFSET 0.0 0.1 0.0
      }
    }
  }
}
MOTION
Frames: 2
Frame Time: 0.5
0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0
2.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0
";

  fn decode_matrix(slot: &[u8], bone: usize) -> Vec<f64> {
    slot[bone * 128..(bone + 1) * 128]
      .chunks_exact(8)
      .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
      .collect()
  }

  #[test]
  fn parses_hierarchy_and_motion() {
    let doc = BvhDocument::parse(SIMPLE_BVH).unwrap();
    assert_eq!(doc.joints.len(), 3);
    assert_eq!(doc.joints[0].name, "Hips");
    assert_eq!(doc.joints[0].parent, -1);
    assert_eq!(doc.joints[1].parent, 0);
    assert_eq!(doc.joints[2].parent, 1);
    assert_eq!(doc.joints[1].channel_base, 6);
    assert_eq!(doc.channels_per_frame, 12);
    assert_eq!(doc.frame_count(), 2);
    assert_eq!(doc.duration(), 1.0);
  }

  #[test]
  fn rejects_malformed_files() {
    assert_eq!(
      BvhDocument::parse("MOTION").unwrap_err(),
      BvhError::UnexpectedToken {
        expected: "HIERARCHY".into(),
        found: "MOTION".into()
      }
    );
    let truncated = &SIMPLE_BVH[..SIMPLE_BVH.len() - 30];
    assert_eq!(
      BvhDocument::parse(truncated).unwrap_err(),
      BvhError::UnexpectedEof
    );
  }

  #[test]
  fn fk_accumulates_parent_offsets() {
    let mut animator = FkAnimator::from_text(SIMPLE_BVH).unwrap();
    assert_eq!(animator.frame_size(), 3 * 128);
    let mut slot = vec![0u8; animator.frame_size()];
    // First tick lands inside frame 0 (all channel values zero).
    animator.write_frame(&mut slot, 0.1, 1.0).unwrap();
    let head = decode_matrix(&slot, 2);
    // ty of the head world transform: 1.0 + 0.5 + 0.25.
    assert!((head[7] - 1.75).abs() < 1e-9);
  }

  #[test]
  fn fk_applies_root_position_channels() {
    let mut animator = FkAnimator::from_text(SIMPLE_BVH).unwrap();
    let mut slot = vec![0u8; animator.frame_size()];
    // Advance into frame 1, which moves the root +2 on x.
    animator.write_frame(&mut slot, 0.6, 1.0).unwrap();
    let hips = decode_matrix(&slot, 0);
    assert!((hips[3] - 2.0).abs() < 1e-9);
  }

  #[test]
  fn looping_wraps_in_both_directions() {
    let mut animator = FkAnimator::from_text(SIMPLE_BVH).unwrap();
    let mut slot = vec![0u8; animator.frame_size()];
    animator.write_frame(&mut slot, 2.3, 1.0).unwrap();
    assert_eq!(animator.current_time(), Some(2.3));
    // 2.3 wraps to 0.3 => frame 0.
    let hips = decode_matrix(&slot, 0);
    assert!(hips[3].abs() < 1e-9);

    // Reverse playback wraps below zero.
    animator.seek(0.0);
    animator.write_frame(&mut slot, 0.1, -4.0).unwrap();
    let hips = decode_matrix(&slot, 0);
    // -0.4 wraps to 0.6 => frame 1.
    assert!((hips[3] - 2.0).abs() < 1e-9);
  }

  #[test]
  fn set_loop_is_exposed() {
    let mut animator = FkAnimator::from_text(SIMPLE_BVH).unwrap();
    match animator.invoke("set_loop", CommandArgs(&serde_json::json!(false))) {
      Invoke::Done(Ok(Value::Bool(false))) => {}
      other => panic!("unexpected invoke outcome: {other:?}"),
    }
    assert!(!animator.looping);
    assert!(matches!(
      animator.invoke("no_such_op", CommandArgs(&Value::Null)),
      Invoke::Unknown
    ));
  }
}
