//! Variational decoder animator: a JSON-serialized conditional decoder maps
//! a small latent vector plus a phase signal to per-bone local rotations,
//! which forward kinematics turns into world matrices.

use std::f64::consts::TAU;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::math::{Mat4, normalize_quat};
use crate::skeleton::SkeletonDef;

use super::{Animator, CommandArgs, Invoke};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
  Linear,
  Tanh,
  Relu,
}

impl Activation {
  fn apply(self, x: f64) -> f64 {
    match self {
      Self::Linear => x,
      Self::Tanh => x.tanh(),
      Self::Relu => x.max(0.0),
    }
  }
}

/// One dense layer: `output = activation(weights * input + bias)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderLayer {
  pub weights: Vec<Vec<f64>>,
  pub bias: Vec<f64>,
  pub activation: Activation,
}

impl DecoderLayer {
  fn forward(&self, input: &[f64]) -> Vec<f64> {
    self
      .weights
      .iter()
      .zip(self.bias.iter())
      .map(|(row, bias)| {
        let sum: f64 = row.iter().zip(input.iter()).map(|(w, x)| w * x).sum();
        self.activation.apply(sum + bias)
      })
      .collect()
  }
}

/// Serialized decoder: the skeleton it was trained on plus dense layers.
/// Decoder input is `[latent, sin(phase), cos(phase)]`; output is one
/// `[x, y, z, w]` quaternion per bone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderModel {
  pub skeleton: SkeletonDef,
  pub latent_dim: usize,
  /// Gait cycle length in seconds driving the phase signal.
  pub period: f64,
  pub layers: Vec<DecoderLayer>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
  #[error("model declares no layers")]
  NoLayers,
  #[error("model period must be positive, got {0}")]
  BadPeriod(f64),
  #[error("layer {layer} expects {expected} inputs, previous layer yields {found}")]
  LayerMismatch {
    layer: usize,
    expected: usize,
    found: usize,
  },
  #[error("layer {layer} bias length {bias} does not match {rows} rows")]
  BiasMismatch {
    layer: usize,
    bias: usize,
    rows: usize,
  },
  #[error("decoder yields {found} values, skeleton needs {expected}")]
  OutputMismatch { expected: usize, found: usize },
}

impl DecoderModel {
  pub fn from_path(path: &Path) -> anyhow::Result<Self> {
    let text = std::fs::read_to_string(path)
      .with_context(|| format!("read decoder model {}", path.display()))?;
    let model: Self = serde_json::from_str(&text)
      .with_context(|| format!("parse decoder model {}", path.display()))?;
    model.skeleton.validate()?;
    model.validate()?;
    Ok(model)
  }

  pub fn validate(&self) -> Result<(), ModelError> {
    if self.layers.is_empty() {
      return Err(ModelError::NoLayers);
    }
    if !self.period.is_finite() || self.period <= 0.0 {
      return Err(ModelError::BadPeriod(self.period));
    }
    // Latent plus the two phase features.
    let mut width = self.latent_dim + 2;
    for (i, layer) in self.layers.iter().enumerate() {
      let expected = layer.weights.first().map_or(0, Vec::len);
      if expected != width || layer.weights.iter().any(|row| row.len() != expected) {
        return Err(ModelError::LayerMismatch {
          layer: i,
          expected,
          found: width,
        });
      }
      if layer.bias.len() != layer.weights.len() {
        return Err(ModelError::BiasMismatch {
          layer: i,
          bias: layer.bias.len(),
          rows: layer.weights.len(),
        });
      }
      width = layer.weights.len();
    }
    let expected = self.skeleton.bone_count() * 4;
    if width != expected {
      return Err(ModelError::OutputMismatch {
        expected,
        found: width,
      });
    }
    Ok(())
  }

  fn decode(&self, latent: &[f64], phase: f64) -> Vec<f64> {
    let mut values: Vec<f64> = latent.to_vec();
    values.push(phase.sin());
    values.push(phase.cos());
    for layer in &self.layers {
      values = layer.forward(&values);
    }
    values
  }
}

/// Streams generated poses by decoding the current latent vector.
pub struct VaeAnimator {
  model: DecoderModel,
  latent: Vec<f64>,
  clock: f64,
}

impl VaeAnimator {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let model = DecoderModel::from_path(path)?;
    Ok(Self::from_model(model))
  }

  pub fn from_model(model: DecoderModel) -> Self {
    let latent = vec![0.0; model.latent_dim];
    Self {
      model,
      latent,
      clock: 0.0,
    }
  }

  pub fn latent(&self) -> &[f64] {
    &self.latent
  }
}

impl Animator for VaeAnimator {
  fn skeleton(&self) -> &SkeletonDef {
    &self.model.skeleton
  }

  fn frame_size(&self) -> usize {
    self.model.skeleton.frame_size()
  }

  fn write_frame(&mut self, slot: &mut [u8], dt: f64, speed: f64) -> anyhow::Result<()> {
    self.clock += dt * speed;
    let phase = TAU * (self.clock / self.model.period);
    let decoded = self.model.decode(&self.latent, phase);

    let skeleton = &self.model.skeleton;
    let mut worlds: Vec<Mat4> = Vec::with_capacity(skeleton.bone_count());
    for bone in 0..skeleton.bone_count() {
      let quat = normalize_quat([
        decoded[bone * 4],
        decoded[bone * 4 + 1],
        decoded[bone * 4 + 2],
        decoded[bone * 4 + 3],
      ]);
      let local =
        Mat4::translation(skeleton.bind_pose.positions[bone]).mul(&Mat4::from_quat(quat));
      let parent = skeleton.parents[bone];
      let world = if parent < 0 {
        local
      } else {
        worlds[parent as usize].mul(&local)
      };
      world.write_to(&mut slot[bone * 128..(bone + 1) * 128]);
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
      "set_vae_values" => Invoke::Done(args.f64_list(self.model.latent_dim).map(|values| {
        self.latent = values;
        json!(self.latent)
      })),
      // Swapping models under a running session is an internal tool only.
      "set_model_path" => Invoke::NotExposed,
      _ => Invoke::Unknown,
    }
  }
}

/// Two-bone model whose decoder ignores its input and always yields
/// identity quaternions through the bias terms. Shared test fixture.
#[cfg(test)]
pub(crate) fn identity_model() -> DecoderModel {
  use crate::skeleton::bind_pose_from_positions;

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
