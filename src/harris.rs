// harris.rs — Multiscale Harris corner detector.
//
// The corner response is the minimum eigenvalue of the windowed structure
// tensor (the Shi-Tomasi form of Harris). With depth > 1 the image is
// analysed at every half-octave and each base pixel keeps its best octave,
// whose lod is recorded alongside the score.
//
// Pipeline for `detect`:
//   1. Half-octave stack: 2·depth − 1 levels (lods 0, 0.5, 1, …)
//   2. Sobel derivatives per level
//   3. Harris response over all levels → [score, lod code]
//   4. Global maximum by parallel reduction (ping-pong)
//   5. Cutoff at quality · max, scores normalised by max
//   6. 3×3 same-scale suppression, then cross-scale suppression against
//      adjacent half-octaves
//   7. Encode with descriptor size 0
//
// `describe` adds an intensity-centroid orientation to keypoints that are
// already encoded.
//
// NEW RUST CONCEPTS:
// - Borrowing a collaborator (`&mut KeypointCodec`) for one call instead
//   of owning it, so the detector and tracker can share a codec.

use log::debug;

use crate::arena::{Purpose, TextureArena};
use crate::backend::{ComputeBackend, KernelArg, KernelSettings, KernelSpec, Texture};
use crate::codec::{EncodedKeypoints, KeypointCodec};
use crate::error::Result;
use crate::keypoint::PYRAMID_MAX_LEVELS;
use crate::program::ProgramGroup;
use crate::pyramid::{Pyramid, PyramidBuilder};

/// Number of derivative inputs bound to the Harris kernel. Unused slots
/// repeat the coarsest level.
pub const SOBEL_OCTAVE_COUNT: usize = 2 * PYRAMID_MAX_LEVELS - 1;

/// Default structure-tensor window.
pub const DEFAULT_WINDOW_SIZE: usize = 3;

pub struct HarrisDetector {
    program: ProgramGroup,
    pyramids: PyramidBuilder,
    arena: TextureArena,
    /// Structure-tensor window, odd, 1–7.
    window_size: usize,
}

impl Default for HarrisDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl HarrisDetector {
    pub fn new() -> Self {
        let mut program = ProgramGroup::new("keypoints");
        program
            .declare(
                "sobel",
                KernelSpec::new("keypoints/multiscale-sobel").with_arguments(&["image"]),
                KernelSettings::default().does_not_recycle_textures(),
            )
            .declare(
                "harris",
                KernelSpec::new("keypoints/multiscale-harris").with_arguments(&[
                    "derivatives",
                    "octaves",
                    "windowSize",
                ]),
                KernelSettings::default(),
            )
            .declare(
                "scanMax",
                KernelSpec::new("utils/scan-max").with_arguments(&["image", "step"]),
                KernelSettings::default().uses_pingpong_rendering(),
            )
            .declare(
                "cutoff",
                KernelSpec::new("keypoints/harris-cutoff").with_arguments(&[
                    "corners",
                    "maxScore",
                    "quality",
                ]),
                KernelSettings::default(),
            )
            .declare(
                "samescale",
                KernelSpec::new("keypoints/samescale-suppression").with_arguments(&["corners"]),
                KernelSettings::default(),
            )
            .declare(
                "multiscale",
                KernelSpec::new("keypoints/multiscale-suppression").with_arguments(&["corners"]),
                KernelSettings::default(),
            )
            .declare(
                "orientation",
                KernelSpec::new("keypoints/orientation-via-centroid").with_arguments(&[
                    "encodedKeypoints",
                    "octaves",
                    "descriptorSize",
                ]),
                KernelSettings::default(),
            )
            .compose("suppression", &["samescale", "multiscale"]);
        HarrisDetector {
            program,
            pyramids: PyramidBuilder::new(),
            arena: TextureArena::new(),
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// # Panics
    /// Panics unless `size` is odd and in 1..=7.
    pub fn set_window_size(&mut self, size: usize) {
        assert!(
            size % 2 == 1 && size <= 7,
            "Harris window size must be odd and at most 7, got {size}"
        );
        self.window_size = size;
    }

    /// Suppressed corner map of `image`: r = normalised score, g = lod
    /// code. The texture is owned by the detector and valid until the next
    /// call.
    pub fn corner_map(
        &mut self,
        backend: &mut dyn ComputeBackend,
        image: Texture,
        quality: f32,
        depth: usize,
    ) -> Result<Texture> {
        let depth = depth.clamp(1, PYRAMID_MAX_LEVELS);
        let octaves = self.pyramids.build_octaves(backend, image, depth)?;
        let count = octaves.len();
        for (i, &level) in octaves.levels().iter().enumerate() {
            self.arena.insert(backend, Purpose::Octave, i, level)?;
            let d = self
                .program
                .call(backend, "sobel", &[KernelArg::Texture(level)])?;
            self.arena.insert(backend, Purpose::Derivatives, i, d)?;
        }

        let derivatives = Pyramid::from_levels(self.arena.all(Purpose::Derivatives));
        let padded = derivatives.padded(SOBEL_OCTAVE_COUNT);
        let corners = self.program.call(
            backend,
            "harris",
            &[
                KernelArg::Textures(&padded),
                KernelArg::Int(count as i32),
                KernelArg::Int(self.window_size as i32),
            ],
        )?;

        let max_score = self.scan_max(backend, corners)?;
        let cut = self.program.call(
            backend,
            "cutoff",
            &[
                KernelArg::Texture(corners),
                KernelArg::Texture(max_score),
                KernelArg::Float(quality.clamp(0.0, 1.0)),
            ],
        )?;
        let suppressed = self.program.run(backend, "suppression", cut, &[])?;

        self.arena.release_all(backend, Purpose::Derivatives)?;
        self.arena.release_all(backend, Purpose::Octave)?;
        debug!(
            "harris: {}×{} over {count} octave(s), quality {quality}",
            image.width, image.height
        );
        Ok(suppressed)
    }

    /// Reduce until texel (0, 0) holds the largest score.
    fn scan_max(&mut self, backend: &mut dyn ComputeBackend, corners: Texture) -> Result<Texture> {
        let extent = corners.width.max(corners.height) as i32;
        let mut current = corners;
        let mut step = 1;
        while step < extent {
            current = self.program.call(
                backend,
                "scanMax",
                &[KernelArg::Texture(current), KernelArg::Int(step)],
            )?;
            step *= 2;
        }
        Ok(current)
    }

    /// Detect corners and encode them. `quality` in [0, 1] is relative to
    /// the strongest corner; `depth` 1 means single scale (no lod).
    pub fn detect(
        &mut self,
        backend: &mut dyn ComputeBackend,
        codec: &mut KeypointCodec,
        image: Texture,
        quality: f32,
        depth: usize,
    ) -> Result<EncodedKeypoints> {
        let corners = self.corner_map(backend, image, quality, depth)?;
        codec.encode(backend, corners, 0)
    }

    /// Compute the orientation of encoded keypoints from `image` at each
    /// keypoint's octave. Returns a new encoded texture with the rotation
    /// bytes filled in; descriptors stay empty.
    pub fn describe(
        &mut self,
        backend: &mut dyn ComputeBackend,
        image: Texture,
        keypoints: &EncodedKeypoints,
        depth: usize,
    ) -> Result<EncodedKeypoints> {
        let octaves = self.pyramids.build_octaves(backend, image, depth)?;
        for (i, &level) in octaves.levels().iter().enumerate() {
            self.arena.insert(backend, Purpose::Octave, i, level)?;
        }
        let padded = octaves.padded(SOBEL_OCTAVE_COUNT);
        let oriented = self.program.call(
            backend,
            "orientation",
            &[
                KernelArg::Texture(keypoints.texture),
                KernelArg::Textures(&padded),
                KernelArg::Int(keypoints.descriptor_size as i32),
            ],
        )?;
        self.arena.release_all(backend, Purpose::Octave)?;
        Ok(EncodedKeypoints {
            texture: oriented,
            ..*keypoints
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use crate::image::{Image, Rgba};

    fn square(w: usize, h: usize) -> Image<Rgba> {
        Image::from_fn(w, h, |x, y| {
            if (10..22).contains(&x) && (10..22).contains(&y) {
                Rgba::grey(1.0)
            } else {
                Rgba::grey(0.0)
            }
        })
    }

    #[test]
    fn test_corner_map_peaks_near_square_corners() {
        let mut cpu = CpuBackend::new();
        let mut harris = HarrisDetector::new();
        let img = cpu.upload(32, 32, square(32, 32).as_slice()).unwrap();
        let map = harris.corner_map(&mut cpu, img, 0.5, 1).unwrap();
        let texels = cpu.texels(map).unwrap();
        let corners: Vec<_> = texels.pixels().filter(|(_, _, p)| p.r() > 0.0).collect();
        assert!(!corners.is_empty());
        for (x, y, _) in &corners {
            let near = |v: usize, a: usize| (v as isize - a as isize).abs() <= 2;
            assert!(
                (near(*x, 10) || near(*x, 21)) && (near(*y, 10) || near(*y, 21)),
                "corner at ({x}, {y})"
            );
        }
        // Intermediates are gone; only the input is caller-owned.
        assert_eq!(cpu.live_textures(), 1);
    }

    #[test]
    fn test_flat_image_has_no_corners() {
        let mut cpu = CpuBackend::new();
        let mut harris = HarrisDetector::new();
        let img = cpu.upload(16, 16, &[Rgba::grey(0.3); 256]).unwrap();
        let map = harris.corner_map(&mut cpu, img, 0.1, 2).unwrap();
        assert!(cpu.texels(map).unwrap().pixels().all(|(_, _, p)| p.r() == 0.0));
    }

    #[test]
    #[should_panic(expected = "window size")]
    fn test_even_window_rejected() {
        HarrisDetector::new().set_window_size(4);
    }
}
