// pyramid.rs — Image pyramids on the compute backend.
//
// All resampling is separable 5-tap filtering plus decimation or
// zero-insertion:
//
//   reduce        smoothX → smoothY → downsample2           (÷2)
//   expand        upsample2 → smoothX2 → smoothY2           (×2)
//   intra_reduce  upsample2 → smoothX2 → smoothY2 → downsample3   (÷1.5)
//   intra_expand  upsample3 → smoothX3 → smoothY3 → downsample2   (×1.5)
//
// The smoothing kernel [a b c b a] = [0.05 0.25 0.4 0.25 0.05] satisfies
// a + 2b + 2c = 1 and a + 2c = 2b, so it is a low-pass with equal
// contribution from every input phase. The interpolation kernels are the
// same shape scaled by 2 and 2.5 so that each zero-stuffed phase keeps unit
// gain after upsampling by 2 and 3. With mirrored borders this holds up to
// the edge for 2×; for 3× the last row and column lose their outer sample.
//
// Every pipeline ends in a non-recycling stage, so each level is a fresh
// caller-owned texture. A `Pyramid` owns its levels until `release`.
//
// NEW RUST CONCEPTS:
// - Returning an owned handle collection (`Pyramid`) whose cleanup needs
//   the backend, so it is an explicit `release` rather than `Drop`.

use log::debug;

use crate::backend::{ComputeBackend, KernelArg, KernelSettings, KernelSpec, Texture};
use crate::error::Result;
use crate::keypoint::PYRAMID_MAX_LEVELS;
use crate::program::ProgramGroup;

/// Low-pass kernel used before decimation.
pub const SMOOTH_WEIGHTS: [f32; 5] = [0.05, 0.25, 0.4, 0.25, 0.05];

/// Interpolation after 2× zero-insertion.
pub const SMOOTH2_WEIGHTS: [f32; 5] = [0.1, 0.5, 0.8, 0.5, 0.1];

/// Interpolation after 3× zero-insertion.
pub const SMOOTH3_WEIGHTS: [f32; 5] = [0.2, 0.8, 1.0, 0.8, 0.2];

/// Scale step between consecutive pyramid levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PyramidRatio {
    #[default]
    Two,
    OneAndHalf,
}

impl PyramidRatio {
    /// Size of a level relative to the next coarser one.
    pub fn factor(self) -> f32 {
        match self {
            PyramidRatio::Two => 2.0,
            PyramidRatio::OneAndHalf => 1.5,
        }
    }
}

/// Caller-owned pyramid levels, finest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Pyramid {
    levels: Vec<Texture>,
    /// Step between consecutive levels. `None` for half-octave stacks and
    /// wrapped textures of unknown layout.
    ratio: Option<PyramidRatio>,
}

impl Pyramid {
    /// Wrap existing caller-owned textures. Panics on an empty list.
    pub fn from_levels(levels: Vec<Texture>) -> Self {
        assert!(!levels.is_empty(), "pyramid must have at least 1 level");
        Pyramid {
            levels,
            ratio: None,
        }
    }

    /// Declare the step between the wrapped levels.
    pub fn with_ratio(mut self, ratio: PyramidRatio) -> Self {
        self.ratio = Some(ratio);
        self
    }

    pub fn ratio(&self) -> Option<PyramidRatio> {
        self.ratio
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Level `i`, or the coarsest level if `i` is past the end.
    pub fn level(&self, i: usize) -> Texture {
        self.levels[i.min(self.levels.len() - 1)]
    }

    pub fn levels(&self) -> &[Texture] {
        &self.levels
    }

    /// Exactly `n` textures, repeating the coarsest level as needed. Kernels
    /// with a fixed number of pyramid inputs bind this.
    pub fn padded(&self, n: usize) -> Vec<Texture> {
        (0..n).map(|i| self.level(i)).collect()
    }

    /// Release every level.
    pub fn release(self, backend: &mut dyn ComputeBackend) -> Result<()> {
        for t in self.levels {
            backend.release(t)?;
        }
        Ok(())
    }
}

/// Builds pyramids and exposes the individual resampling operations.
pub struct PyramidBuilder {
    program: ProgramGroup,
}

impl Default for PyramidBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PyramidBuilder {
    pub fn new() -> Self {
        let conv = |source, weights: &[f32]| {
            KernelSpec::new(source)
                .with_arguments(&["image"])
                .with_weights(weights)
        };
        let resample = |source| KernelSpec::new(source).with_arguments(&["image"]);
        let keep = KernelSettings::default();

        let mut program = ProgramGroup::new("pyramids");
        program
            .declare("smoothX", conv("filters/convolution-x", &SMOOTH_WEIGHTS[..]), keep)
            .declare("smoothY", conv("filters/convolution-y", &SMOOTH_WEIGHTS[..]), keep)
            .declare("smoothX2", conv("filters/convolution-x", &SMOOTH2_WEIGHTS[..]), keep)
            .declare(
                "smoothY2",
                conv("filters/convolution-y", &SMOOTH2_WEIGHTS[..]),
                keep.does_not_recycle_textures(),
            )
            .declare("smoothX3", conv("filters/convolution-x", &SMOOTH3_WEIGHTS[..]), keep)
            .declare("smoothY3", conv("filters/convolution-y", &SMOOTH3_WEIGHTS[..]), keep)
            .declare("upsample2", resample("pyramids/upsample2"), KernelSettings::scaled(2, 1))
            .declare("upsample3", resample("pyramids/upsample3"), KernelSettings::scaled(3, 1))
            .declare(
                "downsample2",
                resample("pyramids/downsample2"),
                KernelSettings::scaled(1, 2).does_not_recycle_textures(),
            )
            .declare(
                "downsample3",
                resample("pyramids/downsample3"),
                KernelSettings::scaled(1, 3).does_not_recycle_textures(),
            )
            .declare(
                "copy",
                resample("utils/identity"),
                keep.does_not_recycle_textures(),
            )
            .compose("reduce", &["smoothX", "smoothY", "downsample2"])
            .compose("expand", &["upsample2", "smoothX2", "smoothY2"])
            .compose(
                "intraReduce",
                &["upsample2", "smoothX2", "smoothY2", "downsample3"],
            )
            .compose(
                "intraExpand",
                &["upsample3", "smoothX3", "smoothY3", "downsample2"],
            );
        PyramidBuilder { program }
    }

    /// Halve the image size. The result is caller-owned.
    pub fn reduce(&mut self, backend: &mut dyn ComputeBackend, image: Texture) -> Result<Texture> {
        self.program.run(backend, "reduce", image, &[])
    }

    /// Double the image size. The result is caller-owned.
    pub fn expand(&mut self, backend: &mut dyn ComputeBackend, image: Texture) -> Result<Texture> {
        self.program.run(backend, "expand", image, &[])
    }

    /// Scale by 2/3. The result is caller-owned.
    pub fn intra_reduce(
        &mut self,
        backend: &mut dyn ComputeBackend,
        image: Texture,
    ) -> Result<Texture> {
        self.program.run(backend, "intraReduce", image, &[])
    }

    /// Scale by 3/2. The result is caller-owned.
    pub fn intra_expand(
        &mut self,
        backend: &mut dyn ComputeBackend,
        image: Texture,
    ) -> Result<Texture> {
        self.program.run(backend, "intraExpand", image, &[])
    }

    /// Caller-owned copy of `image`.
    pub fn copy(&mut self, backend: &mut dyn ComputeBackend, image: Texture) -> Result<Texture> {
        self.program
            .call(backend, "copy", &[KernelArg::Texture(image)])
    }

    /// Build a pyramid with `levels` levels (clamped to
    /// [1, PYRAMID_MAX_LEVELS]). Level 0 is a copy of `image`.
    pub fn build(
        &mut self,
        backend: &mut dyn ComputeBackend,
        image: Texture,
        ratio: PyramidRatio,
        levels: usize,
    ) -> Result<Pyramid> {
        let levels = levels.clamp(1, PYRAMID_MAX_LEVELS);
        let mut out = Vec::with_capacity(levels);
        out.push(self.copy(backend, image)?);
        for i in 1..levels {
            let parent = out[i - 1];
            let next = match ratio {
                PyramidRatio::Two => self.reduce(backend, parent)?,
                PyramidRatio::OneAndHalf => self.intra_reduce(backend, parent)?,
            };
            out.push(next);
        }
        debug!(
            "pyramid {ratio:?}: {} levels from {}×{}",
            levels, image.width, image.height
        );
        Ok(Pyramid {
            levels: out,
            ratio: Some(ratio),
        })
    }

    /// Half-octave stack for lods 0, 0.5, 1, …, depth - 1: `2 * depth - 1`
    /// levels with `depth` clamped to [1, PYRAMID_MAX_LEVELS]. Integer lods
    /// come from `reduce`, half lods from `intra_reduce` of level 0 and
    /// `reduce` of the previous half lod.
    pub fn build_octaves(
        &mut self,
        backend: &mut dyn ComputeBackend,
        image: Texture,
        depth: usize,
    ) -> Result<Pyramid> {
        let depth = depth.clamp(1, PYRAMID_MAX_LEVELS);
        let count = 2 * depth - 1;
        let mut out: Vec<Texture> = Vec::with_capacity(count);
        for k in 0..count {
            let level = match k {
                0 => self.copy(backend, image)?,
                1 => self.intra_reduce(backend, out[0])?,
                _ => self.reduce(backend, out[k - 2])?,
            };
            out.push(level);
        }
        Ok(Pyramid {
            levels: out,
            ratio: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use crate::image::Rgba;

    fn upload(cpu: &mut CpuBackend, w: u32, h: u32, v: f32) -> Texture {
        cpu.upload(w, h, &vec![Rgba::grey(v); (w * h) as usize]).unwrap()
    }

    #[test]
    fn test_level_dimensions() {
        let mut cpu = CpuBackend::new();
        let mut builder = PyramidBuilder::new();
        let img = upload(&mut cpu, 64, 48, 0.5);
        let pyr = builder.build(&mut cpu, img, PyramidRatio::Two, 4).unwrap();
        let sizes: Vec<_> = pyr.levels().iter().map(|t| t.size()).collect();
        assert_eq!(sizes, vec![(64, 48), (32, 24), (16, 12), (8, 6)]);
    }

    #[test]
    fn test_levels_are_clamped() {
        let mut cpu = CpuBackend::new();
        let mut builder = PyramidBuilder::new();
        let img = upload(&mut cpu, 64, 64, 0.5);
        let pyr = builder.build(&mut cpu, img, PyramidRatio::Two, 9).unwrap();
        assert_eq!(pyr.len(), PYRAMID_MAX_LEVELS);
        let one = builder.build(&mut cpu, img, PyramidRatio::Two, 0).unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn test_level_access_clamps_and_pads() {
        let mut cpu = CpuBackend::new();
        let mut builder = PyramidBuilder::new();
        let img = upload(&mut cpu, 16, 16, 0.5);
        let pyr = builder.build(&mut cpu, img, PyramidRatio::Two, 2).unwrap();
        assert_eq!(pyr.level(7), pyr.level(1));
        let padded = pyr.padded(4);
        assert_eq!(padded.len(), 4);
        assert_eq!(padded[3], pyr.level(1));
    }

    #[test]
    fn test_constant_image_stays_constant() {
        let mut cpu = CpuBackend::new();
        let mut builder = PyramidBuilder::new();
        let img = upload(&mut cpu, 30, 20, 0.7);
        for t in [
            builder.reduce(&mut cpu, img).unwrap(),
            builder.expand(&mut cpu, img).unwrap(),
            builder.intra_reduce(&mut cpu, img).unwrap(),
        ] {
            for (x, y, p) in cpu.texels(t).unwrap().pixels() {
                assert!((p.r() - 0.7).abs() < 1e-4, "{:?} ({x},{y}) = {}", t.size(), p.r());
            }
        }
    }

    #[test]
    fn test_intra_expand_gain_away_from_far_edge() {
        // The last 3× phase has no sample beyond it, so the final row and
        // column come out darker. Everything else keeps unit gain.
        let mut cpu = CpuBackend::new();
        let mut builder = PyramidBuilder::new();
        let img = upload(&mut cpu, 30, 20, 0.7);
        let t = builder.intra_expand(&mut cpu, img).unwrap();
        let (w, h) = (t.width as usize, t.height as usize);
        for (x, y, p) in cpu.texels(t).unwrap().pixels() {
            if x + 1 < w && y + 1 < h {
                assert!((p.r() - 0.7).abs() < 1e-4, "({x},{y}) = {}", p.r());
            }
        }
    }

    #[test]
    fn test_intra_octave_sizes() {
        let mut cpu = CpuBackend::new();
        let mut builder = PyramidBuilder::new();
        let img = upload(&mut cpu, 60, 30, 0.5);
        assert_eq!(builder.intra_reduce(&mut cpu, img).unwrap().size(), (40, 20));
        assert_eq!(builder.intra_expand(&mut cpu, img).unwrap().size(), (90, 45));
    }

    #[test]
    fn test_octaves_and_release() {
        let mut cpu = CpuBackend::new();
        let mut builder = PyramidBuilder::new();
        let img = upload(&mut cpu, 64, 64, 0.5);
        let octaves = builder.build_octaves(&mut cpu, img, 3).unwrap();
        let sizes: Vec<_> = octaves.levels().iter().map(|t| t.size()).collect();
        // lods 0, 0.5, 1, 1.5, 2
        assert_eq!(sizes, vec![(64, 64), (43, 43), (32, 32), (22, 22), (16, 16)]);
        octaves.release(&mut cpu).unwrap();
        assert_eq!(cpu.live_textures(), 1);
    }
}
