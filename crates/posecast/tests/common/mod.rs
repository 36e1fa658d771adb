//! Shared fixtures for the black-box tests: on-disk animation sources and
//! session options pointing at the real worker binary.
#![allow(dead_code)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use posecast::animator::vae::{Activation, DecoderLayer, DecoderModel};
use posecast::session::SessionOptions;
use posecast::skeleton::{SkeletonDef, bind_pose_from_positions};

/// The compiled `posecast` binary, used as the worker executable.
pub fn worker_bin() -> PathBuf {
  PathBuf::from(env!("CARGO_BIN_EXE_posecast"))
}

pub fn session_opts() -> SessionOptions {
  SessionOptions {
    buffer_count: 3,
    fps: 60.0,
    worker_bin: Some(worker_bin()),
  }
}

/// Build a BVH clip with `bones` joints in one chain. The root moves +1 on
/// x per frame; all rotations stay zero.
pub fn chain_bvh(bones: usize, frames: usize) -> String {
  assert!(bones >= 1 && frames >= 1);
  let mut text = String::new();
  text.push_str("HIERARCHY\nROOT bone_0\n{\n");
  text.push_str("OFFSET 0.0 0.0 0.0\n");
  text.push_str("CHANNELS 6 Xposition Yposition Zposition Zrotation Xrotation Yrotation\n");
  for i in 1..bones {
    writeln!(text, "JOINT bone_{i}").unwrap();
    text.push_str("{\nOFFSET 0.0 1.0 0.0\nCHANNELS 3 Zrotation Xrotation Yrotation\n");
  }
  text.push_str("End Site\n{\nOFFSET 0.0 1.0 0.0\n}\n");
  for _ in 0..bones {
    text.push_str("}\n");
  }
  writeln!(text, "MOTION\nFrames: {frames}\nFrame Time: 0.0333").unwrap();
  let channels = 6 + (bones - 1) * 3;
  for frame in 0..frames {
    write!(text, "{}.0", frame).unwrap();
    for _ in 1..channels {
      text.push_str(" 0.0");
    }
    text.push('\n');
  }
  text
}

pub fn write_chain_bvh(dir: &Path, name: &str, bones: usize, frames: usize) -> PathBuf {
  let path = dir.join(name);
  std::fs::write(&path, chain_bvh(bones, frames)).unwrap();
  path
}

/// Two-bone decoder model whose bias terms yield identity quaternions.
pub fn decoder_model() -> DecoderModel {
  let skeleton = SkeletonDef::new(
    vec!["root".into(), "tip".into()],
    vec![-1, 0],
    bind_pose_from_positions(vec![[0.0, 1.0, 0.0], [0.0, 0.5, 0.0]]),
  )
  .unwrap();
  DecoderModel {
    skeleton,
    latent_dim: 3,
    period: 1.0,
    layers: vec![DecoderLayer {
      weights: vec![vec![0.0; 5]; 8],
      bias: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
      activation: Activation::Linear,
    }],
  }
}

pub fn write_decoder_model(dir: &Path, name: &str) -> PathBuf {
  let path = dir.join(name);
  std::fs::write(&path, serde_json::to_string(&decoder_model()).unwrap()).unwrap();
  path
}
