use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One 4x4 `f64` matrix per bone, row-major.
pub const BYTES_PER_BONE: usize = 16 * 8;

/// Per-bone rest transforms, indexed like `bone_names`.
/// Rotations are quaternions as `[x, y, z, w]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindPose {
  pub positions: Vec<[f64; 3]>,
  pub rotations: Vec<[f64; 4]>,
  pub scales: Vec<[f64; 3]>,
}

/// Discovery document sent to subscribers before they decode binary frames.
///
/// `parents` is causal: entry `i` is `-1` for a root or a strictly smaller
/// bone index, so walking the list in order always visits parents first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkeletonDef {
  #[serde(rename = "type", default = "doc_type")]
  pub doc_type: String,
  pub bone_names: Vec<String>,
  pub parents: Vec<i32>,
  pub bind_pose: BindPose,
}

fn doc_type() -> String {
  "SKELETON_DEF".to_string()
}

#[derive(Debug, Error, PartialEq)]
pub enum SkeletonError {
  #[error("skeleton has no bones")]
  Empty,
  #[error("skeleton arrays disagree on bone count")]
  LengthMismatch,
  #[error("bone {bone} has non-causal parent {parent}")]
  AcausalParent { bone: usize, parent: i32 },
}

impl SkeletonDef {
  pub fn new(
    bone_names: Vec<String>,
    parents: Vec<i32>,
    bind_pose: BindPose,
  ) -> Result<Self, SkeletonError> {
    let def = Self {
      doc_type: doc_type(),
      bone_names,
      parents,
      bind_pose,
    };
    def.validate()?;
    Ok(def)
  }

  pub fn bone_count(&self) -> usize {
    self.bone_names.len()
  }

  /// Byte size of one pose frame for this skeleton.
  pub fn frame_size(&self) -> usize {
    self.bone_count() * BYTES_PER_BONE
  }

  pub fn validate(&self) -> Result<(), SkeletonError> {
    let count = self.bone_names.len();
    if count == 0 {
      return Err(SkeletonError::Empty);
    }
    if self.parents.len() != count
      || self.bind_pose.positions.len() != count
      || self.bind_pose.rotations.len() != count
      || self.bind_pose.scales.len() != count
    {
      return Err(SkeletonError::LengthMismatch);
    }
    for (bone, &parent) in self.parents.iter().enumerate() {
      if parent != -1 && (parent < 0 || parent as usize >= bone) {
        return Err(SkeletonError::AcausalParent { bone, parent });
      }
    }
    Ok(())
  }
}

/// Bind pose with the given rest positions, identity rotations, unit scales.
pub fn bind_pose_from_positions(positions: Vec<[f64; 3]>) -> BindPose {
  let count = positions.len();
  BindPose {
    positions,
    rotations: vec![[0.0, 0.0, 0.0, 1.0]; count],
    scales: vec![[1.0, 1.0, 1.0]; count],
  }
}
