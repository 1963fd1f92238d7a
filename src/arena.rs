// arena.rs — Ownership ledger for caller-owned transient textures.
//
// Every caller-owned texture a detector, tracker or frame pipeline creates
// is parked here under a (purpose, index) key, e.g. (Octave, 3) or
// (Pyramid, 0). Replacing an entry releases the previous occupant, and
// `end_frame` releases everything that was not explicitly retained for the
// next frame. The previous pyramid survives a frame by being retained and
// then promoted. Encoded keypoints are kernel-owned and never parked here.
//
// Only caller-owned textures belong here. Kernel-owned (recycled) outputs
// are overwritten by their kernel and must never be released.
//
// NEW RUST CONCEPTS:
// - `BTreeMap` with a tuple key: ordered iteration makes release order
//   deterministic, and `range` selects all entries of one purpose.
// - `retain` on a map with a closure that has side effects collected
//   separately, because the backend cannot be borrowed inside it.

use std::collections::BTreeMap;

use log::trace;

use crate::backend::{ComputeBackend, Texture};
use crate::error::Result;

/// What a parked texture is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Purpose {
    Frame,
    Pyramid,
    PreviousPyramid,
    Octave,
    Derivatives,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    texture: Texture,
    retained: bool,
}

/// Textures keyed by (purpose, index).
#[derive(Debug, Default)]
pub struct TextureArena {
    entries: BTreeMap<(Purpose, usize), Entry>,
}

impl TextureArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Park `texture` under (purpose, index), releasing whatever was there.
    pub fn insert(
        &mut self,
        backend: &mut dyn ComputeBackend,
        purpose: Purpose,
        index: usize,
        texture: Texture,
    ) -> Result<Texture> {
        let old = self.entries.insert(
            (purpose, index),
            Entry {
                texture,
                retained: false,
            },
        );
        if let Some(old) = old {
            if old.texture.id != texture.id {
                trace!("arena: replacing {purpose:?}[{index}]");
                backend.release(old.texture)?;
            }
        }
        Ok(texture)
    }

    pub fn get(&self, purpose: Purpose, index: usize) -> Option<Texture> {
        self.entries.get(&(purpose, index)).map(|e| e.texture)
    }

    /// All textures of one purpose, by index. Gaps are skipped.
    pub fn all(&self, purpose: Purpose) -> Vec<Texture> {
        self.entries
            .range((purpose, 0)..=(purpose, usize::MAX))
            .map(|(_, e)| e.texture)
            .collect()
    }

    /// Keep every entry of `purpose` alive across the next `end_frame`.
    pub fn retain_all(&mut self, purpose: Purpose) {
        for (_, e) in self.entries.range_mut((purpose, 0)..=(purpose, usize::MAX)) {
            e.retained = true;
        }
    }

    /// Release one entry. Returns whether it existed.
    pub fn release(
        &mut self,
        backend: &mut dyn ComputeBackend,
        purpose: Purpose,
        index: usize,
    ) -> Result<bool> {
        match self.entries.remove(&(purpose, index)) {
            Some(e) => {
                backend.release(e.texture)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release every entry of one purpose. Returns how many were released.
    pub fn release_all(
        &mut self,
        backend: &mut dyn ComputeBackend,
        purpose: Purpose,
    ) -> Result<usize> {
        let keys: Vec<_> = self
            .entries
            .range((purpose, 0)..=(purpose, usize::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            if let Some(e) = self.entries.remove(key) {
                backend.release(e.texture)?;
            }
        }
        Ok(keys.len())
    }

    /// Move every entry of `from` to `to`, keeping indices. Existing `to`
    /// entries are released first. Moved entries keep their retained flag.
    pub fn promote(
        &mut self,
        backend: &mut dyn ComputeBackend,
        from: Purpose,
        to: Purpose,
    ) -> Result<usize> {
        self.release_all(backend, to)?;
        let moved: Vec<_> = self
            .entries
            .range((from, 0)..=(from, usize::MAX))
            .map(|(k, e)| (k.1, *e))
            .collect();
        for (index, e) in &moved {
            self.entries.remove(&(from, *index));
            self.entries.insert((to, *index), *e);
        }
        Ok(moved.len())
    }

    /// Release every entry that was not retained and clear the retained
    /// flags of the survivors. Returns the number released.
    pub fn end_frame(&mut self, backend: &mut dyn ComputeBackend) -> Result<usize> {
        let mut dropped = Vec::new();
        self.entries.retain(|_, e| {
            if e.retained {
                e.retained = false;
                true
            } else {
                dropped.push(e.texture);
                false
            }
        });
        for texture in &dropped {
            backend.release(*texture)?;
        }
        trace!("arena: end of frame, {} released, {} kept", dropped.len(), self.len());
        Ok(dropped.len())
    }

    /// Release everything.
    pub fn clear(&mut self, backend: &mut dyn ComputeBackend) -> Result<()> {
        for (_, e) in std::mem::take(&mut self.entries) {
            backend.release(e.texture)?;
        }
        Ok(())
    }
}
