// klt.rs — Batched pyramidal Lucas-Kanade tracker over encoded keypoints.
//
// Tracks every keypoint of an encoded texture from the previous frame's
// pyramid into the next frame's. The per-keypoint solver is forward-additive
// LK (gradients at the warped position in the next frame, Hessian rebuilt
// each iteration), run coarse-to-fine over `depth` levels with the
// displacement scaled up by the pyramid ratio between levels. Both
// pyramids must share a uniform ratio; half-octave stacks are rejected.
//
// Work is split into passes of at most MAX_KEYPOINTS_PER_PASS keypoints so
// that a single dispatch stays short on slow devices. Each pass runs two
// kernels over its slot range:
//
//   lk          new position, or the discard marker if lost
//   lk-discard  discard marker if the window residual exceeds the threshold
//
// and its output is the input of the next pass. Both kernels ping-pong, so
// a pass never reads the texture it writes.
//
// Window sizes are served by four kernel tiers, each compiled for its own
// maximum window. Smaller tiers mean smaller per-invocation loops on a GPU.
//
// Lost keypoints keep their slot. Decoding the result yields exactly as
// many keypoints as went in; the lost ones are flagged in the decode report.
//
// NEW RUST CONCEPTS:
// - Struct update syntax (`..*keypoints`) to copy a `Copy` struct while
//   replacing one field.
// - `const` arrays of tuples as small lookup tables.

use log::trace;

use crate::backend::{ComputeBackend, KernelArg, KernelSettings, KernelSpec};
use crate::codec::EncodedKeypoints;
use crate::error::Result;
use crate::keypoint::PYRAMID_MAX_LEVELS;
use crate::program::ProgramGroup;
use crate::pyramid::Pyramid;

/// Keypoints handled per pass.
pub const MAX_KEYPOINTS_PER_PASS: usize = 100;

pub const MIN_WINDOW_SIZE: usize = 5;
pub const MAX_WINDOW_SIZE: usize = 21;

/// (largest window, lk kernel, discard kernel), smallest tier first.
const TIERS: [(usize, &str, &str); 4] = [
    (7, "lkSmallest", "lkDiscardSmallest"),
    (11, "lkSmaller", "lkDiscardSmaller"),
    (15, "lkSmall", "lkDiscardSmall"),
    (21, "lk", "lkDiscard"),
];

/// Tracking parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LkParams {
    /// Full window side in pixels. Forced odd and clamped to [5, 21].
    pub window_size: usize,
    /// Pyramid levels used, clamped to [1, PYRAMID_MAX_LEVELS].
    pub depth: usize,
    /// Mean squared intensity residual (intensities in [0, 1]) above which
    /// a tracked keypoint is discarded.
    pub discard_threshold: f32,
}

impl Default for LkParams {
    fn default() -> Self {
        LkParams {
            window_size: 15,
            depth: 3,
            discard_threshold: 1e-4,
        }
    }
}

/// Odd window size in [MIN_WINDOW_SIZE, MAX_WINDOW_SIZE].
pub fn normalize_window_size(window_size: usize) -> usize {
    let odd = if window_size % 2 == 0 {
        window_size + 1
    } else {
        window_size
    };
    odd.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE)
}

/// Passes needed for `count` keypoints. Always at least one.
pub fn pass_count(count: usize) -> usize {
    (count.max(1) + MAX_KEYPOINTS_PER_PASS - 1) / MAX_KEYPOINTS_PER_PASS
}

pub struct LkTracker {
    program: ProgramGroup,
}

impl Default for LkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LkTracker {
    pub fn new() -> Self {
        let pingpong = KernelSettings::default().uses_pingpong_rendering();
        let mut program = ProgramGroup::new("trackers");
        for (max_window, lk, discard) in TIERS {
            program
                .declare(
                    lk,
                    KernelSpec::new("trackers/lk")
                        .with_arguments(&[
                            "encodedKeypoints",
                            "nextPyramid",
                            "prevPyramid",
                            "windowSize",
                            "depth",
                            "levelScale",
                            "descriptorSize",
                            "firstKeypointIndex",
                            "lastKeypointIndex",
                        ])
                        .with_define("MAX_WINDOW_SIZE", max_window as f64),
                    pingpong,
                )
                .declare(
                    discard,
                    KernelSpec::new("trackers/lk-discard")
                        .with_arguments(&[
                            "encodedKeypoints",
                            "prevKeypoints",
                            "nextPyramid",
                            "prevPyramid",
                            "windowSize",
                            "discardThreshold",
                            "descriptorSize",
                            "firstKeypointIndex",
                            "lastKeypointIndex",
                        ])
                        .with_define("MAX_WINDOW_SIZE", max_window as f64),
                    pingpong,
                );
        }
        LkTracker { program }
    }

    /// Kernel names serving a (normalised) window size.
    fn tier(window_size: usize) -> (&'static str, &'static str) {
        TIERS
            .iter()
            .find(|(max, _, _)| window_size <= *max)
            .map(|&(_, lk, discard)| (lk, discard))
            .unwrap_or(("lk", "lkDiscard"))
    }

    /// Track `keypoints` from `prev` into `next`.
    ///
    /// The result is owned by the tracker and valid until the next call.
    /// Feed it to the next frame through a download/upload round trip (or a
    /// copy), not directly: its texture is one of this tracker's ping-pong
    /// targets. `depth` is capped at the levels both pyramids have.
    ///
    /// # Panics
    /// Panics unless both pyramids declare the same `PyramidRatio`.
    pub fn track(
        &mut self,
        backend: &mut dyn ComputeBackend,
        next: &Pyramid,
        prev: &Pyramid,
        keypoints: &EncodedKeypoints,
        params: &LkParams,
    ) -> Result<EncodedKeypoints> {
        let ratio = match (next.ratio(), prev.ratio()) {
            (Some(a), Some(b)) if a == b => a,
            other => panic!("tracking needs two pyramids of one uniform ratio, got {other:?}"),
        };
        let window = normalize_window_size(params.window_size);
        let depth = params
            .depth
            .min(next.len())
            .min(prev.len())
            .clamp(1, PYRAMID_MAX_LEVELS);
        let (lk, discard) = Self::tier(window);
        let next_levels = next.padded(PYRAMID_MAX_LEVELS);
        let prev_levels = prev.padded(PYRAMID_MAX_LEVELS);

        let count = keypoints.count.unwrap_or_else(|| keypoints.capacity());
        let passes = pass_count(count);
        let descriptor_size = keypoints.descriptor_size as i32;

        let mut current = keypoints.texture;
        for pass in 0..passes {
            let first = pass * MAX_KEYPOINTS_PER_PASS;
            let last = (first + MAX_KEYPOINTS_PER_PASS).min(count.max(1)) - 1;
            trace!("lk pass {}/{passes}: keypoints {first}..={last}", pass + 1);

            let moved = self.program.call(
                backend,
                lk,
                &[
                    KernelArg::Texture(current),
                    KernelArg::Textures(&next_levels),
                    KernelArg::Textures(&prev_levels),
                    KernelArg::Int(window as i32),
                    KernelArg::Int(depth as i32),
                    KernelArg::Float(ratio.factor()),
                    KernelArg::Int(descriptor_size),
                    KernelArg::Int(first as i32),
                    KernelArg::Int(last as i32),
                ],
            )?;
            current = self.program.call(
                backend,
                discard,
                &[
                    KernelArg::Texture(moved),
                    KernelArg::Texture(keypoints.texture),
                    KernelArg::Textures(&next_levels),
                    KernelArg::Textures(&prev_levels),
                    KernelArg::Int(window as i32),
                    KernelArg::Float(params.discard_threshold),
                    KernelArg::Int(descriptor_size),
                    KernelArg::Int(first as i32),
                    KernelArg::Int(last as i32),
                ],
            )?;
        }

        Ok(EncodedKeypoints {
            texture: current,
            ..*keypoints
        })
    }
}
