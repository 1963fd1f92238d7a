// cpu/mod.rs — Reference compute backend.
//
// `CpuBackend` implements `ComputeBackend` on the host. It is the
// authoritative definition of every kernel the crate uses: the wgpu backend
// is expected to reproduce these outputs, and all algorithm tests run here.
//
// Textures live in a slot arena. A slot holds an `Image<Rgba>` plus its
// owner (the caller, or the recycling kernel that produced it). Releasing a
// slot bumps its generation, so any handle still pointing at it becomes
// invalid.
//
// Kernels are looked up by source key at instantiation time:
//
//   filters/*     separable convolution
//   pyramids/*    zero-stuffing upsample and decimating downsample
//   colors/*      RGB → greyscale
//   utils/*       identity copy/crop, parallel max reduction
//   keypoints/*   Sobel, Harris response, cutoff, suppression, orientation
//   encoders/*    keypoint offsets, packing, upload
//   trackers/*    pyramidal LK and its discard pass
//
// NEW RUST CONCEPTS:
// - Splitting a `&self` compute phase from a `&mut self` store phase so
//   the borrow checker lets kernels read inputs while the arena is updated
//   afterwards.
// - Generational indices as a safe alternative to raw pointers/ids.

pub mod encoders;
pub mod filters;
pub mod keypoints;
pub mod trackers;

use std::collections::HashMap;

use log::{debug, trace};

use crate::backend::{
    ComputeBackend, KernelArg, KernelId, KernelSettings, KernelSpec, OutputSize, Readback,
    Texture, TextureId,
};
use crate::error::{Error, Result};
use crate::image::{Image, Rgba};

// ---------------------------------------------------------------------------
// Kernel dispatch
// ---------------------------------------------------------------------------

/// Kernels implemented by the CPU backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    ConvolutionX,
    ConvolutionY,
    Upsample2,
    Downsample2,
    Upsample3,
    Downsample3,
    Rgb2Grey,
    Identity,
    ScanMax,
    Sobel,
    Harris,
    HarrisCutoff,
    SamescaleSuppression,
    MultiscaleSuppression,
    Orientation,
    EncodeOffsets,
    EncodeKeypoints,
    UploadKeypoints,
    Lk,
    LkDiscard,
}

impl Op {
    fn from_source(source: &str) -> Option<Op> {
        Some(match source {
            "filters/convolution-x" => Op::ConvolutionX,
            "filters/convolution-y" => Op::ConvolutionY,
            "pyramids/upsample2" => Op::Upsample2,
            "pyramids/downsample2" => Op::Downsample2,
            "pyramids/upsample3" => Op::Upsample3,
            "pyramids/downsample3" => Op::Downsample3,
            "colors/rgb2grey" => Op::Rgb2Grey,
            "utils/identity" => Op::Identity,
            "utils/scan-max" => Op::ScanMax,
            "keypoints/multiscale-sobel" => Op::Sobel,
            "keypoints/multiscale-harris" => Op::Harris,
            "keypoints/harris-cutoff" => Op::HarrisCutoff,
            "keypoints/samescale-suppression" => Op::SamescaleSuppression,
            "keypoints/multiscale-suppression" => Op::MultiscaleSuppression,
            "keypoints/orientation-via-centroid" => Op::Orientation,
            "encoders/encode-keypoint-offsets" => Op::EncodeOffsets,
            "encoders/encode-keypoints" => Op::EncodeKeypoints,
            "encoders/upload-keypoints" => Op::UploadKeypoints,
            "trackers/lk" => Op::Lk,
            "trackers/lk-discard" => Op::LkDiscard,
            _ => return None,
        })
    }

    fn run(self, ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
        match self {
            Op::ConvolutionX => filters::convolution_x(ctx),
            Op::ConvolutionY => filters::convolution_y(ctx),
            Op::Upsample2 => filters::upsample(ctx, 2),
            Op::Downsample2 => filters::downsample(ctx, 2),
            Op::Upsample3 => filters::upsample(ctx, 3),
            Op::Downsample3 => filters::downsample(ctx, 3),
            Op::Rgb2Grey => filters::rgb2grey(ctx),
            Op::Identity => filters::identity(ctx),
            Op::ScanMax => filters::scan_max(ctx),
            Op::Sobel => keypoints::sobel(ctx),
            Op::Harris => keypoints::harris(ctx),
            Op::HarrisCutoff => keypoints::harris_cutoff(ctx),
            Op::SamescaleSuppression => keypoints::samescale_suppression(ctx),
            Op::MultiscaleSuppression => keypoints::multiscale_suppression(ctx),
            Op::Orientation => keypoints::orientation_via_centroid(ctx),
            Op::EncodeOffsets => encoders::encode_keypoint_offsets(ctx),
            Op::EncodeKeypoints => encoders::encode_keypoints(ctx),
            Op::UploadKeypoints => encoders::upload_keypoints(ctx),
            Op::Lk => trackers::lk(ctx),
            Op::LkDiscard => trackers::lk_discard(ctx),
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel context: resolved arguments handed to a kernel function
// ---------------------------------------------------------------------------

pub(crate) enum Value<'a> {
    Image(&'a Image<Rgba>),
    Images(Vec<&'a Image<Rgba>>),
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    Bytes(&'a [u8]),
}

/// Everything a kernel function sees: its spec, output size and arguments.
pub(crate) struct KernelContext<'a> {
    pub name: &'a str,
    pub spec: &'a KernelSpec,
    pub width: usize,
    pub height: usize,
    values: Vec<Value<'a>>,
}

impl<'a> KernelContext<'a> {
    fn mismatch(&self, index: usize, expected: &str) -> Error {
        let arg = self.spec.arguments.get(index).copied().unwrap_or("?");
        Error::InvalidArgument {
            kernel: self.name.to_string(),
            reason: format!("argument {index} (`{arg}`) must be {expected}"),
        }
    }

    pub fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidArgument {
            kernel: self.name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn image(&self, index: usize) -> Result<&'a Image<Rgba>> {
        match self.values.get(index) {
            Some(Value::Image(img)) => Ok(img),
            _ => Err(self.mismatch(index, "a texture")),
        }
    }

    pub fn images(&self, index: usize) -> Result<&[&'a Image<Rgba>]> {
        match self.values.get(index) {
            Some(Value::Images(imgs)) if !imgs.is_empty() => Ok(imgs),
            _ => Err(self.mismatch(index, "a non-empty texture array")),
        }
    }

    pub fn float(&self, index: usize) -> Result<f32> {
        match self.values.get(index) {
            Some(Value::Float(v)) => Ok(*v),
            Some(Value::Int(v)) => Ok(*v as f32),
            _ => Err(self.mismatch(index, "a number")),
        }
    }

    pub fn int(&self, index: usize) -> Result<i32> {
        match self.values.get(index) {
            Some(Value::Int(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "an integer")),
        }
    }

    pub fn vec2(&self, index: usize) -> Result<[f32; 2]> {
        match self.values.get(index) {
            Some(Value::Vec2(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "a vec2")),
        }
    }

    pub fn bytes(&self, index: usize) -> Result<&'a [u8]> {
        match self.values.get(index) {
            Some(Value::Bytes(b)) => Ok(b),
            _ => Err(self.mismatch(index, "a byte buffer")),
        }
    }

    /// Integer argument that must lie in `range`.
    pub fn int_in(&self, index: usize, range: std::ops::RangeInclusive<i32>) -> Result<i32> {
        let v = self.int(index)?;
        if range.contains(&v) {
            Ok(v)
        } else {
            Err(self.invalid(format!(
                "argument {index} = {v} outside [{}, {}]",
                range.start(),
                range.end()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Texture arena
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Caller,
    Kernel(KernelId),
}

struct Slot {
    generation: u32,
    content: Option<(Image<Rgba>, Owner)>,
}

struct CpuKernel {
    name: String,
    op: Op,
    spec: KernelSpec,
    settings: KernelSettings,
    output: OutputSize,
    /// Kernel-owned output textures: one, or two with ping-pong rendering.
    targets: Vec<Texture>,
    /// Index into `targets` of the texture the next invocation writes.
    next: usize,
}

impl CpuKernel {
    fn target_count(&self) -> usize {
        if self.settings.pingpong {
            2
        } else {
            1
        }
    }

    /// The target written most recently, if any.
    fn last_target(&self) -> Option<Texture> {
        let n = self.target_count();
        self.targets.get((self.next + n - 1) % n).copied()
    }
}

/// Host implementation of `ComputeBackend`.
#[derive(Default)]
pub struct CpuBackend {
    slots: Vec<Slot>,
    free: Vec<u32>,
    kernels: Vec<CpuKernel>,
    invocations: HashMap<&'static str, usize>,
    fail_next_readback: bool,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the texels of a live texture.
    pub fn texels(&self, texture: Texture) -> Result<&Image<Rgba>> {
        self.slots
            .get(texture.id.index as usize)
            .filter(|s| s.generation == texture.id.generation)
            .and_then(|s| s.content.as_ref())
            .map(|(img, _)| img)
            .ok_or(Error::ReleasedTexture(texture.id))
    }

    /// How many times kernels with this source key have run.
    pub fn invocation_count(&self, source: &str) -> usize {
        self.invocations.get(source).copied().unwrap_or(0)
    }

    /// Live caller-owned textures. Non-zero after a frame means a leak.
    pub fn live_textures(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.content, Some((_, Owner::Caller))))
            .count()
    }

    /// Make the next readback fail with `Error::Readback`. Used to exercise
    /// the transient-failure path.
    pub fn fail_next_readback(&mut self) {
        self.fail_next_readback = true;
    }

    fn kernel(&self, kernel: KernelId) -> Result<&CpuKernel> {
        self.kernels
            .get(kernel.0 as usize)
            .ok_or_else(|| Error::InvalidArgument {
                kernel: format!("#{}", kernel.0),
                reason: "unknown kernel id".into(),
            })
    }

    fn insert(&mut self, image: Image<Rgba>, owner: Owner) -> Texture {
        let (width, height) = (image.width() as u32, image.height() as u32);
        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize].content = Some((image, owner));
                i
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    content: Some((image, owner)),
                });
                (self.slots.len() - 1) as u32
            }
        };
        Texture {
            id: TextureId {
                index,
                generation: self.slots[index as usize].generation,
            },
            width,
            height,
        }
    }

    /// Overwrite a kernel-owned slot, returning a handle with the new size.
    fn overwrite(&mut self, target: Texture, image: Image<Rgba>, owner: Owner) -> Texture {
        let (width, height) = (image.width() as u32, image.height() as u32);
        self.slots[target.id.index as usize].content = Some((image, owner));
        Texture {
            id: target.id,
            width,
            height,
        }
    }

    fn resolve<'a>(&'a self, arg: &KernelArg<'a>) -> Result<Value<'a>> {
        Ok(match *arg {
            KernelArg::Texture(t) => Value::Image(self.texels(t)?),
            KernelArg::Textures(ts) => {
                Value::Images(ts.iter().map(|&t| self.texels(t)).collect::<Result<_>>()?)
            }
            KernelArg::Float(v) => Value::Float(v),
            KernelArg::Int(v) => Value::Int(v),
            KernelArg::Vec2(v) => Value::Vec2(v),
            KernelArg::Bytes(b) => Value::Bytes(b),
        })
    }

    /// Validate arguments and run the kernel. Read-only on `self`.
    fn execute(&self, kernel: KernelId, args: &[KernelArg<'_>]) -> Result<Image<Rgba>> {
        let k = self.kernel(kernel)?;
        if args.len() != k.spec.arguments.len() {
            return Err(Error::ArgumentMismatch {
                kernel: k.name.clone(),
                expected: k.spec.arguments.len(),
                got: args.len(),
            });
        }

        let write_target = k.targets.get(k.next).map(|t| t.id);
        for t in KernelArg::textures(args) {
            let reads_target = Some(t.id) == write_target;
            let reads_own_output = !k.settings.pingpong && k.targets.iter().any(|o| o.id == t.id);
            if reads_target || reads_own_output {
                return Err(Error::SelfRead(k.name.clone()));
            }
        }

        let first = KernelArg::textures(args).next().map(|t| t.size());
        let (width, height) = k.output.resolve(first).ok_or_else(|| Error::InvalidArgument {
            kernel: k.name.clone(),
            reason: "output size unknown: no texture argument and no fixed size".into(),
        })?;

        let values = args
            .iter()
            .map(|a| self.resolve(a))
            .collect::<Result<Vec<_>>>()?;
        let ctx = KernelContext {
            name: &k.name,
            spec: &k.spec,
            width: width as usize,
            height: height as usize,
            values,
        };
        k.op.run(&ctx)
    }

    /// Hand a freshly computed image to its owner according to the
    /// kernel's recycling policy.
    fn store(&mut self, kernel: KernelId, image: Image<Rgba>) -> Texture {
        let idx = kernel.0 as usize;
        if !self.kernels[idx].settings.recycle_texture {
            return self.insert(image, Owner::Caller);
        }
        let next = self.kernels[idx].next;
        let texture = match self.kernels[idx].targets.get(next).copied() {
            Some(target) => self.overwrite(target, image, Owner::Kernel(kernel)),
            None => self.insert(image, Owner::Kernel(kernel)),
        };
        let k = &mut self.kernels[idx];
        if next < k.targets.len() {
            k.targets[next] = texture;
        } else {
            k.targets.push(texture);
        }
        k.next = (next + 1) % k.target_count();
        texture
    }
}

impl ComputeBackend for CpuBackend {
    fn create_kernel(
        &mut self,
        name: &str,
        spec: &KernelSpec,
        settings: &KernelSettings,
    ) -> Result<KernelId> {
        let op = Op::from_source(spec.source)
            .ok_or_else(|| Error::UnsupportedKernel(spec.source.to_string()))?;
        let id = KernelId(self.kernels.len() as u32);
        debug!("instantiating kernel `{name}` ({}) as {:?}", spec.source, id);
        self.kernels.push(CpuKernel {
            name: name.to_string(),
            op,
            spec: spec.clone(),
            settings: *settings,
            output: settings.output,
            targets: Vec::new(),
            next: 0,
        });
        Ok(id)
    }

    fn invoke(&mut self, kernel: KernelId, args: &[KernelArg<'_>]) -> Result<Texture> {
        let image = self.execute(kernel, args)?;
        let source = self.kernels[kernel.0 as usize].spec.source;
        *self.invocations.entry(source).or_insert(0) += 1;
        trace!(
            "{} -> {}×{}",
            self.kernels[kernel.0 as usize].name,
            image.width(),
            image.height()
        );
        Ok(self.store(kernel, image))
    }

    fn resize(&mut self, kernel: KernelId, width: u32, height: u32) -> Result<()> {
        self.kernel(kernel)?;
        let k = &mut self.kernels[kernel.0 as usize];
        let fixed = OutputSize::Fixed { width, height };
        if k.output != fixed {
            debug!("resizing kernel `{}` to {width}×{height}", k.name);
            k.output = fixed;
        }
        Ok(())
    }

    fn clear(&mut self, kernel: KernelId, color: [f32; 4]) -> Result<Texture> {
        let k = self.kernel(kernel)?;
        let target = k.last_target();
        let size = match k.output {
            OutputSize::Fixed { width, height } => Some((width, height)),
            _ => target.map(|t| t.size()),
        };
        let (width, height) = size.ok_or_else(|| Error::InvalidArgument {
            kernel: k.name.clone(),
            reason: "cannot clear a kernel without an output size".into(),
        })?;
        let image = Image::filled(width as usize, height as usize, Rgba(color));
        match target {
            Some(t) if k.settings.recycle_texture => {
                let k_name = k.name.clone();
                trace!("clearing `{k_name}`");
                let cleared = self.overwrite(t, image, Owner::Kernel(kernel));
                let k = &mut self.kernels[kernel.0 as usize];
                if let Some(slot) = k.targets.iter_mut().find(|o| o.id == cleared.id) {
                    *slot = cleared;
                }
                Ok(cleared)
            }
            _ => Ok(self.store(kernel, image)),
        }
    }

    fn upload(&mut self, width: u32, height: u32, texels: &[Rgba]) -> Result<Texture> {
        if texels.len() != width as usize * height as usize {
            return Err(Error::InvalidArgument {
                kernel: "upload".into(),
                reason: format!(
                    "{} texels for a {width}×{height} texture",
                    texels.len()
                ),
            });
        }
        let image = Image::from_vec(width as usize, height as usize, texels.to_vec());
        Ok(self.insert(image, Owner::Caller))
    }

    fn release(&mut self, texture: Texture) -> Result<()> {
        self.texels(texture)?;
        let slot = &mut self.slots[texture.id.index as usize];
        if let Some((_, Owner::Kernel(k))) = slot.content {
            let kernel = self.kernels[k.0 as usize].name.clone();
            return Err(Error::KernelOwnedTexture {
                texture: texture.id,
                kernel,
            });
        }
        slot.content = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(texture.id.index);
        Ok(())
    }

    fn read_pixels(&mut self, texture: Texture) -> Result<Vec<u8>> {
        if std::mem::take(&mut self.fail_next_readback) {
            return Err(Error::Readback("injected readback failure".into()));
        }
        Ok(self.texels(texture)?.to_bytes())
    }

    fn read_pixels_async(&mut self, texture: Texture) -> Result<Readback> {
        // The host backend has nothing to overlap with: complete eagerly.
        Ok(Readback::ready(self.read_pixels(texture)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grey(w: u32, h: u32, v: f32) -> Vec<Rgba> {
        vec![Rgba::grey(v); (w * h) as usize]
    }

    #[test]
    fn test_upload_release_generation() {
        let mut cpu = CpuBackend::new();
        let t = cpu.upload(4, 4, &grey(4, 4, 0.5)).unwrap();
        assert_eq!(cpu.live_textures(), 1);
        cpu.release(t).unwrap();
        assert_eq!(cpu.live_textures(), 0);
        assert!(matches!(cpu.texels(t), Err(Error::ReleasedTexture(_))));
        // The slot is reused, but the stale handle stays invalid.
        let t2 = cpu.upload(2, 2, &grey(2, 2, 0.1)).unwrap();
        assert_eq!(t2.id.index, t.id.index);
        assert!(cpu.texels(t).is_err());
        assert!(matches!(cpu.release(t), Err(Error::ReleasedTexture(_))));
    }

    #[test]
    fn test_unknown_source_rejected() {
        let mut cpu = CpuBackend::new();
        let err = cpu
            .create_kernel("x", &KernelSpec::new("filters/nope"), &KernelSettings::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedKernel(_)));
    }

    #[test]
    fn test_argument_count_checked() {
        let mut cpu = CpuBackend::new();
        let spec = KernelSpec::new("utils/identity").with_arguments(&["image"]);
        let k = cpu.create_kernel("copy", &spec, &KernelSettings::default()).unwrap();
        let err = cpu.invoke(k, &[]).unwrap_err();
        assert!(matches!(err, Error::ArgumentMismatch { expected: 1, got: 0, .. }));
    }

    #[test]
    fn test_recycled_output_is_kernel_owned() {
        let mut cpu = CpuBackend::new();
        let spec = KernelSpec::new("utils/identity").with_arguments(&["image"]);
        let k = cpu.create_kernel("copy", &spec, &KernelSettings::default()).unwrap();
        let input = cpu.upload(3, 3, &grey(3, 3, 0.25)).unwrap();

        let a = cpu.invoke(k, &[KernelArg::Texture(input)]).unwrap();
        let b = cpu.invoke(k, &[KernelArg::Texture(input)]).unwrap();
        assert_eq!(a.id, b.id, "recycling kernels reuse one texture");
        assert!(matches!(cpu.release(a), Err(Error::KernelOwnedTexture { .. })));

        // Reading its own output without ping-pong is refused.
        let err = cpu.invoke(k, &[KernelArg::Texture(a)]).unwrap_err();
        assert!(matches!(err, Error::SelfRead(_)));
    }

    #[test]
    fn test_pingpong_alternates_targets() {
        let mut cpu = CpuBackend::new();
        let spec = KernelSpec::new("utils/identity").with_arguments(&["image"]);
        let settings = KernelSettings::default().uses_pingpong_rendering();
        let k = cpu.create_kernel("copy", &spec, &settings).unwrap();
        let input = cpu.upload(3, 3, &grey(3, 3, 0.25)).unwrap();

        let a = cpu.invoke(k, &[KernelArg::Texture(input)]).unwrap();
        let b = cpu.invoke(k, &[KernelArg::Texture(a)]).unwrap();
        let c = cpu.invoke(k, &[KernelArg::Texture(b)]).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id, c.id);
        assert_eq!(cpu.texels(c).unwrap().get(1, 1), Rgba::grey(0.25));
    }

    #[test]
    fn test_non_recycling_output_is_caller_owned() {
        let mut cpu = CpuBackend::new();
        let spec = KernelSpec::new("utils/identity").with_arguments(&["image"]);
        let settings = KernelSettings::default().does_not_recycle_textures();
        let k = cpu.create_kernel("copy", &spec, &settings).unwrap();
        let input = cpu.upload(3, 3, &grey(3, 3, 0.25)).unwrap();
        let a = cpu.invoke(k, &[KernelArg::Texture(input)]).unwrap();
        let b = cpu.invoke(k, &[KernelArg::Texture(input)]).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(cpu.live_textures(), 3);
        cpu.release(a).unwrap();
        cpu.release(b).unwrap();
        cpu.release(input).unwrap();
        assert_eq!(cpu.live_textures(), 0);
    }

    #[test]
    fn test_resize_and_clear() {
        let mut cpu = CpuBackend::new();
        let spec = KernelSpec::new("utils/identity").with_arguments(&["image"]);
        let k = cpu.create_kernel("copy", &spec, &KernelSettings::default()).unwrap();
        cpu.resize(k, 5, 2).unwrap();
        let cleared = cpu.clear(k, [0.0, 1.0, 0.0, 1.0]).unwrap();
        assert_eq!(cleared.size(), (5, 2));
        assert_eq!(cpu.texels(cleared).unwrap().get(4, 1), Rgba::new(0.0, 1.0, 0.0, 1.0));

        // Identity crops/pads to the fixed size.
        let input = cpu.upload(3, 3, &grey(3, 3, 1.0)).unwrap();
        let out = cpu.invoke(k, &[KernelArg::Texture(input)]).unwrap();
        assert_eq!(out.id, cleared.id);
        let img = cpu.texels(out).unwrap();
        assert_eq!(img.get(2, 1), Rgba::grey(1.0));
        assert_eq!(img.get(4, 1), Rgba::ZERO);
    }

    #[test]
    fn test_injected_readback_failure() {
        let mut cpu = CpuBackend::new();
        let t = cpu.upload(1, 1, &grey(1, 1, 1.0)).unwrap();
        cpu.fail_next_readback();
        assert!(matches!(cpu.read_pixels(t), Err(Error::Readback(_))));
        assert_eq!(cpu.read_pixels(t).unwrap(), vec![255, 255, 255, 255]);
    }
}
