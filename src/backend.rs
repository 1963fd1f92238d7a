// backend.rs — The compute capability the core is written against.
//
// Everything above this file (program groups, the codec, the detector and
// the tracker) talks to a `ComputeBackend` and never to a GPU API directly.
// A backend knows how to:
//
//   - instantiate a kernel from a `KernelSpec` (a source key plus the
//     constants baked into it) and `KernelSettings` (output sizing and
//     buffer policy),
//   - invoke it on textures and scalar arguments, returning a texture,
//   - resize or clear a kernel's output,
//   - upload host texels, release textures, and read pixels back either
//     synchronously or through a `Readback` that completes later.
//
// Two backends exist: `cpu::CpuBackend`, the reference implementation of
// every kernel, and `gpu::backend::WgpuBackend` (feature `gpu`), which
// dispatches externally supplied WGSL under the same names.
//
// TEXTURE OWNERSHIP
// ─────────────────
// A `Texture` is a small Copy handle. Who may release it depends on how it
// was produced:
//
//   upload / non-recycling kernel  → caller-owned, must be released
//   recycling kernel               → kernel-owned, overwritten by the
//                                    kernel's next invocation
//
// Handles carry a generation counter so that a stale handle (released, or
// pointing at a reused slot) is rejected with `Error::ReleasedTexture`
// instead of silently reading someone else's data.
//
// NEW RUST CONCEPTS:
// - A trait object (`&mut dyn ComputeBackend`) as the seam between the
//   algorithms and the device.
// - Default trait methods (`wait_readback`).
// - `std::sync::mpsc` channels as a one-shot future, the same shape as
//   wgpu's `map_async` callback.

use std::sync::mpsc;

use crate::error::{Error, Result};
use crate::image::{Image, Rgba};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Identity of a texture slot plus the generation that was live when the
/// handle was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// A device-resident RGBA texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
}

impl Texture {
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Number of texels.
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// An instantiated kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub(crate) u32);

// ---------------------------------------------------------------------------
// Kernel description
// ---------------------------------------------------------------------------

/// What a kernel computes: a source key (e.g. `"filters/convolution-x"`),
/// the names of its arguments, and constants baked in at instantiation.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSpec {
    pub source: &'static str,
    pub arguments: Vec<&'static str>,
    pub defines: Vec<(&'static str, f64)>,
    pub weights: Vec<f32>,
}

impl KernelSpec {
    pub fn new(source: &'static str) -> Self {
        KernelSpec {
            source,
            arguments: Vec::new(),
            defines: Vec::new(),
            weights: Vec::new(),
        }
    }

    pub fn with_arguments(mut self, names: &[&'static str]) -> Self {
        self.arguments = names.to_vec();
        self
    }

    pub fn with_define(mut self, name: &'static str, value: f64) -> Self {
        self.defines.push((name, value));
        self
    }

    /// Convolution taps, centre tap in the middle.
    pub fn with_weights(mut self, weights: &[f32]) -> Self {
        self.weights = weights.to_vec();
        self
    }

    pub fn define(&self, name: &str) -> Option<f64> {
        self.defines.iter().find(|(n, _)| *n == name).map(|&(_, v)| v)
    }
}

/// How a kernel sizes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSize {
    /// Same size as the first texture argument.
    Input,
    /// First texture argument scaled by `num / den`, rounded up.
    Scaled { num: u32, den: u32 },
    /// Fixed size, set at declaration or by `resize`.
    Fixed { width: u32, height: u32 },
}

impl OutputSize {
    /// Resolve against the size of the first texture argument.
    pub fn resolve(&self, input: Option<(u32, u32)>) -> Option<(u32, u32)> {
        match *self {
            OutputSize::Fixed { width, height } => Some((width, height)),
            OutputSize::Input => input,
            OutputSize::Scaled { num, den } => input.map(|(w, h)| {
                (
                    ((w * num + den - 1) / den).max(1),
                    ((h * num + den - 1) / den).max(1),
                )
            }),
        }
    }
}

/// Declarative buffer policy for a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSettings {
    pub output: OutputSize,
    /// `false` when the kernel draws to a displayable surface rather than
    /// an offscreen texture.
    pub render_to_texture: bool,
    /// `true`: the kernel owns one output texture and overwrites it on each
    /// call. `false`: every call returns a new caller-owned texture.
    pub recycle_texture: bool,
    /// Alternate between two output textures so the kernel can consume its
    /// previous result.
    pub pingpong: bool,
}

impl Default for KernelSettings {
    fn default() -> Self {
        KernelSettings {
            output: OutputSize::Input,
            render_to_texture: true,
            recycle_texture: true,
            pingpong: false,
        }
    }
}

impl KernelSettings {
    pub fn has_texture_size(width: u32, height: u32) -> Self {
        KernelSettings {
            output: OutputSize::Fixed { width, height },
            ..Default::default()
        }
    }

    pub fn scaled(num: u32, den: u32) -> Self {
        KernelSettings {
            output: OutputSize::Scaled { num, den },
            ..Default::default()
        }
    }

    pub fn displays_graphics(mut self) -> Self {
        self.render_to_texture = false;
        self
    }

    pub fn does_not_recycle_textures(mut self) -> Self {
        self.recycle_texture = false;
        self
    }

    pub fn uses_pingpong_rendering(mut self) -> Self {
        self.pingpong = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// One positional kernel argument.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Texture(Texture),
    /// A fixed-length array of textures (pyramid levels, octaves).
    Textures(&'a [Texture]),
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    /// Raw bytes bound as a storage/uniform buffer.
    Bytes(&'a [u8]),
}

impl<'a> KernelArg<'a> {
    /// Texture arguments, in order, flattening arrays.
    pub fn textures(args: &'a [KernelArg<'a>]) -> impl Iterator<Item = Texture> + 'a {
        args.iter().flat_map(|a| match a {
            KernelArg::Texture(t) => std::slice::from_ref(t).iter().copied(),
            KernelArg::Textures(ts) => ts.iter().copied(),
            _ => (&[] as &[Texture]).iter().copied(),
        })
    }
}

// ---------------------------------------------------------------------------
// Readback
// ---------------------------------------------------------------------------

/// A pending transfer of texture pixels to host memory.
pub struct Readback {
    receiver: mpsc::Receiver<Result<Vec<u8>>>,
}

impl Readback {
    /// Wrap the receiving end of a one-shot channel.
    pub fn from_receiver(receiver: mpsc::Receiver<Result<Vec<u8>>>) -> Self {
        Readback { receiver }
    }

    /// A readback that has already completed.
    pub fn ready(result: Result<Vec<u8>>) -> Self {
        let (tx, rx) = mpsc::channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(result);
        Readback { receiver: rx }
    }

    /// Poll without blocking. `None` while the transfer is still in flight.
    pub fn try_wait(&self) -> Option<Result<Vec<u8>>> {
        match self.receiver.try_recv() {
            Ok(r) => Some(r),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(Error::ContextLost)),
        }
    }

    /// Block until the pixels arrive.
    pub fn wait(self) -> Result<Vec<u8>> {
        self.receiver.recv().map_err(|_| Error::ContextLost)?
    }
}

// ---------------------------------------------------------------------------
// ComputeBackend
// ---------------------------------------------------------------------------

/// Kernel instantiation, invocation and texture transfer.
///
/// Pixel readbacks return row-major RGBA bytes (4 per texel), each channel
/// quantised as `round(clamp(v, 0, 1) * 255)`.
pub trait ComputeBackend {
    /// Instantiate a kernel. `name` is used for diagnostics only.
    fn create_kernel(
        &mut self,
        name: &str,
        spec: &KernelSpec,
        settings: &KernelSettings,
    ) -> Result<KernelId>;

    /// Run a kernel and return its output texture.
    fn invoke(&mut self, kernel: KernelId, args: &[KernelArg<'_>]) -> Result<Texture>;

    /// Fix the output size of a kernel.
    fn resize(&mut self, kernel: KernelId, width: u32, height: u32) -> Result<()>;

    /// Fill a kernel's current output texture with `color` and return it.
    fn clear(&mut self, kernel: KernelId, color: [f32; 4]) -> Result<Texture>;

    /// Create a caller-owned texture from host texels (row-major).
    fn upload(&mut self, width: u32, height: u32, texels: &[Rgba]) -> Result<Texture>;

    /// Release a caller-owned texture.
    fn release(&mut self, texture: Texture) -> Result<()>;

    /// Blocking readback.
    fn read_pixels(&mut self, texture: Texture) -> Result<Vec<u8>>;

    /// Start a readback and return immediately.
    fn read_pixels_async(&mut self, texture: Texture) -> Result<Readback>;

    /// Drive the device until `readback` completes.
    fn wait_readback(&mut self, readback: Readback) -> Result<Vec<u8>> {
        readback.wait()
    }
}

/// Upload an 8-bit greyscale frame as a caller-owned texture.
pub fn upload_grey(backend: &mut dyn ComputeBackend, image: &Image<u8>) -> Result<Texture> {
    let texels = Image::<Rgba>::from_grey(image);
    backend.upload(image.width() as u32, image.height() as u32, texels.as_slice())
}

/// Read a texture back as an `Image<Rgba>` (8-bit quantised).
pub fn download_image(backend: &mut dyn ComputeBackend, texture: Texture) -> Result<Image<Rgba>> {
    let bytes = backend.read_pixels(texture)?;
    Ok(Image::from_bytes(
        texture.width as usize,
        texture.height as usize,
        &bytes,
    ))
}
