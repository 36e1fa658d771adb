//! Memory-mapped slot region holding `count` pose frames.
//!
//! The session creates, sizes, and finally unlinks the backing file; the
//! worker maps it writable and is the region's only writer. Safety rests on
//! strict slot rotation with at least three slots: a slot handed to the
//! consumer is not rewritten until the producer has cycled through all
//! others.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use memmap2::{Mmap, MmapMut};

/// Read-only view over the slot region, held by the broadcaster.
pub struct SlotReader {
  map: Mmap,
  frame_size: usize,
  count: usize,
}

impl SlotReader {
  /// Create and size the backing file, then map it read-only.
  pub fn create(path: &Path, count: usize, frame_size: usize) -> Result<Self> {
    ensure!(count > 0 && frame_size > 0, "empty slot region");
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(true)
      .open(path)
      .with_context(|| format!("create slot region {}", path.display()))?;
    file
      .set_len((count * frame_size) as u64)
      .context("size slot region")?;
    // The worker writes concurrently; readers only ever see whole slots
    // that rotation keeps stable while announced.
    let map = unsafe { Mmap::map(&file) }.context("map slot region")?;
    Ok(Self {
      map,
      frame_size,
      count,
    })
  }

  pub fn count(&self) -> usize {
    self.count
  }

  pub fn frame_size(&self) -> usize {
    self.frame_size
  }

  pub fn slot(&self, index: usize) -> &[u8] {
    let base = index * self.frame_size;
    &self.map[base..base + self.frame_size]
  }
}

/// Writable view over the slot region, held by the worker.
pub struct SlotWriter {
  map: MmapMut,
  frame_size: usize,
  count: usize,
}

impl SlotWriter {
  /// Map an existing region and verify it has the expected geometry.
  pub fn open(path: &Path, count: usize, frame_size: usize) -> Result<Self> {
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .open(path)
      .with_context(|| format!("open slot region {}", path.display()))?;
    let expected = (count * frame_size) as u64;
    let actual = file.metadata().context("stat slot region")?.len();
    ensure!(
      actual == expected,
      "slot region is {actual} bytes, expected {expected}"
    );
    let map = unsafe { MmapMut::map_mut(&file) }.context("map slot region writable")?;
    Ok(Self {
      map,
      frame_size,
      count,
    })
  }

  pub fn count(&self) -> usize {
    self.count
  }

  pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
    let base = index * self.frame_size;
    &mut self.map[base..base + self.frame_size]
  }
}

/// Remove the backing file. A missing file is not an error.
pub fn unlink(path: &Path) -> std::io::Result<()> {
  match std::fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
    Err(err) => Err(err),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn writer_changes_are_visible_to_the_reader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slots.mem");
    let reader = SlotReader::create(&path, 3, 16).unwrap();
    let mut writer = SlotWriter::open(&path, 3, 16).unwrap();

    writer.slot_mut(1).copy_from_slice(&[7u8; 16]);
    assert_eq!(reader.slot(1), &[7u8; 16]);
    assert_eq!(reader.slot(0), &[0u8; 16]);
    assert_eq!(reader.count(), 3);
    assert_eq!(reader.frame_size(), 16);
  }

  #[test]
  fn writer_rejects_mismatched_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slots.mem");
    let _reader = SlotReader::create(&path, 3, 16).unwrap();
    assert!(SlotWriter::open(&path, 4, 16).is_err());
  }

  #[test]
  fn unlink_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slots.mem");
    let _reader = SlotReader::create(&path, 3, 16).unwrap();
    unlink(&path).unwrap();
    unlink(&path).unwrap();
    assert!(!path.exists());
  }
}
