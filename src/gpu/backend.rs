// gpu/backend.rs — `ComputeBackend` on wgpu compute pipelines.
//
// Every kernel runs as a compute shader with entry point `main` over one
// invocation per output texel, against one shared bind group layout:
//
//   binding 0        uniform KernelParams (output size, scalar arguments)
//   bindings 1..=16  texture_2d<f32>, texture arguments in order (arrays
//                    flattened); unused slots hold a 1×1 placeholder
//   binding 17       texture_storage_2d<rgba32float, write>, the output
//   binding 18       storage buffer (array<u32>), the `Bytes` argument
//
// Scalar arguments fill `KernelParams::values` in order, one vec4<u32> per
// argument: floats and vec2s as f32 bits (`bitcast<f32>`), ints as i32
// bits. `KernelSpec` defines and weights (`WEIGHT_0`, `WEIGHT_1`, ...) are pipeline
// override constants next to `WORKGROUP_X` / `WORKGROUP_Y`, so the WGSL
// must declare every one of them.
//
// Textures are rgba32float. Readback quantises each channel to a byte, the
// same as the CPU backend, through a row-aligned staging buffer mapped with
// `map_async`.
//
// Handle bookkeeping (generations, kernel-owned targets, ping-pong) is the
// same as `cpu::CpuBackend`, so the algorithms behave identically on both.
//
// NEW RUST CONCEPTS:
// - Error scopes: `push_error_scope` / `pop_error_scope` turn wgpu's
//   validation errors into values instead of the default panic handler.
// - `Arc<wgpu::Buffer>` moved into the `map_async` callback so the mapped
//   range can be read there and sent through a channel.

use std::collections::HashMap;
use std::sync::{mpsc, Arc};

use log::{debug, trace};
use wgpu::util::DeviceExt;

use crate::backend::{
    ComputeBackend, KernelArg, KernelId, KernelSettings, KernelSpec, OutputSize, Readback,
    Texture, TextureId,
};
use crate::error::{Error, Result};
use crate::gpu::device::{GpuDevice, GpuError};
use crate::image::Rgba;

/// Texture bindings available to one kernel.
pub const MAX_TEXTURE_ARGUMENTS: usize = 16;

/// Scalar (non-texture, non-bytes) arguments available to one kernel.
pub const MAX_SCALAR_ARGUMENTS: usize = 15;

const PARAMS_BINDING: u32 = 0;
const FIRST_TEXTURE_BINDING: u32 = 1;
const OUTPUT_BINDING: u32 = FIRST_TEXTURE_BINDING + MAX_TEXTURE_ARGUMENTS as u32;
const BYTES_BINDING: u32 = OUTPUT_BINDING + 1;

const TEXEL_BYTES: u32 = 16;
const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

/// Uniform block at binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct KernelParams {
    output_size: [u32; 2],
    texture_count: u32,
    byte_count: u32,
    values: [[u32; 4]; MAX_SCALAR_ARGUMENTS],
}

impl KernelParams {
    /// Pack the scalar arguments. `None` if there are too many.
    fn pack(output: (u32, u32), args: &[KernelArg<'_>]) -> Option<Self> {
        let mut params = KernelParams {
            output_size: [output.0, output.1],
            texture_count: KernelArg::textures(args).count() as u32,
            byte_count: 0,
            values: [[0; 4]; MAX_SCALAR_ARGUMENTS],
        };
        let mut slot = 0;
        for arg in args {
            let value = match *arg {
                KernelArg::Float(v) => [v.to_bits(), 0, 0, 0],
                KernelArg::Int(v) => [v as u32, 0, 0, 0],
                KernelArg::Vec2([x, y]) => [x.to_bits(), y.to_bits(), 0, 0],
                KernelArg::Bytes(b) => {
                    params.byte_count = b.len() as u32;
                    continue;
                }
                KernelArg::Texture(_) | KernelArg::Textures(_) => continue,
            };
            *params.values.get_mut(slot)? = value;
            slot += 1;
        }
        Some(params)
    }
}

/// Bytes per staging row: whole texels, padded to wgpu's copy alignment.
fn padded_row_bytes(width: u32) -> u32 {
    let unpadded = width * TEXEL_BYTES;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (unpadded + align - 1) / align * align
}

/// Strip row padding and quantise rgba32float texels to bytes.
fn quantise_rows(mapped: &[u8], width: u32, height: u32, row_bytes: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height as usize {
        let start = y * row_bytes as usize;
        let row = &mapped[start..start + (width * TEXEL_BYTES) as usize];
        out.extend(
            row.chunks_exact(TEXEL_BYTES as usize)
                .flat_map(|c| bytemuck::pod_read_unaligned::<Rgba>(c).to_bytes()),
        );
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Caller,
    Kernel(KernelId),
}

struct DeviceTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    owner: Owner,
}

struct Slot {
    generation: u32,
    content: Option<DeviceTexture>,
}

struct GpuKernel {
    name: String,
    spec: KernelSpec,
    settings: KernelSettings,
    output: OutputSize,
    pipeline: wgpu::ComputePipeline,
    targets: Vec<Texture>,
    next: usize,
}

impl GpuKernel {
    fn target_count(&self) -> usize {
        if self.settings.pingpong {
            2
        } else {
            1
        }
    }
}

/// wgpu implementation of `ComputeBackend`.
pub struct WgpuBackend {
    gpu: GpuDevice,
    shaders: HashMap<String, String>,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    placeholder: wgpu::TextureView,
    empty_bytes: wgpu::Buffer,
    slots: Vec<Slot>,
    free: Vec<u32>,
    kernels: Vec<GpuKernel>,
}

impl WgpuBackend {
    pub fn new(gpu: GpuDevice) -> Self {
        let device = &gpu.device;
        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: PARAMS_BINDING,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        entries.extend((0..MAX_TEXTURE_ARGUMENTS as u32).map(|i| wgpu::BindGroupLayoutEntry {
            binding: FIRST_TEXTURE_BINDING + i,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
            },
            count: None,
        }));
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: OUTPUT_BINDING,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: FORMAT,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: BYTES_BINDING,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel layout"),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kernel pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let placeholder = create_texture(device, 1, 1, "placeholder")
            .create_view(&wgpu::TextureViewDescriptor::default());
        let empty_bytes = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("empty bytes"),
            size: 16,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        WgpuBackend {
            gpu,
            shaders: HashMap::new(),
            layout,
            pipeline_layout,
            placeholder,
            empty_bytes,
            slots: Vec::new(),
            free: Vec::new(),
            kernels: Vec::new(),
        }
    }

    /// Register the WGSL implementing a kernel source key. Kernels created
    /// afterwards with that key compile this text.
    pub fn register_shader(&mut self, source: &str, wgsl: impl Into<String>) {
        self.shaders.insert(source.to_string(), wgsl.into());
    }

    pub fn device(&self) -> &GpuDevice {
        &self.gpu
    }

    fn texture(&self, texture: Texture) -> Result<&DeviceTexture> {
        self.slots
            .get(texture.id.index as usize)
            .filter(|s| s.generation == texture.id.generation)
            .and_then(|s| s.content.as_ref())
            .ok_or(Error::ReleasedTexture(texture.id))
    }

    fn kernel(&self, kernel: KernelId) -> Result<&GpuKernel> {
        self.kernels
            .get(kernel.0 as usize)
            .ok_or_else(|| Error::InvalidArgument {
                kernel: format!("#{}", kernel.0),
                reason: "unknown kernel id".into(),
            })
    }

    fn insert(&mut self, width: u32, height: u32, owner: Owner) -> Texture {
        let texture = create_texture(&self.gpu.device, width, height, "texture");
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let content = Some(DeviceTexture {
            texture,
            view,
            owner,
        });
        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize].content = content;
                i
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    content,
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

    /// Kernel-owned texture the next invocation of `kernel` writes, sized
    /// `width`×`height`. Reallocated in place when the size changed.
    fn target(&mut self, kernel: KernelId, width: u32, height: u32) -> Texture {
        let idx = kernel.0 as usize;
        if !self.kernels[idx].settings.recycle_texture {
            return self.insert(width, height, Owner::Caller);
        }
        let next = self.kernels[idx].next;
        let texture = match self.kernels[idx].targets.get(next).copied() {
            Some(t) if t.size() == (width, height) => t,
            Some(t) => {
                let texture = create_texture(&self.gpu.device, width, height, "texture");
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                self.slots[t.id.index as usize].content = Some(DeviceTexture {
                    texture,
                    view,
                    owner: Owner::Kernel(kernel),
                });
                Texture { id: t.id, width, height }
            }
            None => self.insert(width, height, Owner::Kernel(kernel)),
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

    /// Validate the arguments and work out the output size.
    fn check(&self, kernel: KernelId, args: &[KernelArg<'_>]) -> Result<(u32, u32)> {
        let k = self.kernel(kernel)?;
        if args.len() != k.spec.arguments.len() {
            return Err(Error::ArgumentMismatch {
                kernel: k.name.clone(),
                expected: k.spec.arguments.len(),
                got: args.len(),
            });
        }
        if KernelArg::textures(args).count() > MAX_TEXTURE_ARGUMENTS {
            return Err(Error::InvalidArgument {
                kernel: k.name.clone(),
                reason: format!("more than {MAX_TEXTURE_ARGUMENTS} texture arguments"),
            });
        }
        let write_target = k.targets.get(k.next).map(|t| t.id);
        for t in KernelArg::textures(args) {
            self.texture(t)?;
            let reads_target = Some(t.id) == write_target;
            let reads_own_output = !k.settings.pingpong && k.targets.iter().any(|o| o.id == t.id);
            if reads_target || reads_own_output {
                return Err(Error::SelfRead(k.name.clone()));
            }
        }
        let first = KernelArg::textures(args).next().map(|t| t.size());
        k.output.resolve(first).ok_or_else(|| Error::InvalidArgument {
            kernel: k.name.clone(),
            reason: "output size unknown: no texture argument and no fixed size".into(),
        })
    }

    fn write_texels(&self, texture: Texture, texels: &[Rgba]) -> Result<()> {
        let device_texture = self.texture(texture)?;
        self.gpu.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &device_texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(texels),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(texture.width * TEXEL_BYTES),
                rows_per_image: Some(texture.height),
            },
            extent(texture.width, texture.height),
        );
        Ok(())
    }
}

fn create_texture(device: &wgpu::Device, width: u32, height: u32, label: &str) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: extent(width, height),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::STORAGE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

impl ComputeBackend for WgpuBackend {
    fn create_kernel(
        &mut self,
        name: &str,
        spec: &KernelSpec,
        settings: &KernelSettings,
    ) -> Result<KernelId> {
        let wgsl = self
            .shaders
            .get(spec.source)
            .ok_or_else(|| Error::UnsupportedKernel(spec.source.to_string()))?;

        let mut constants = self.gpu.workgroup_size.as_constants();
        constants.extend(spec.defines.iter().map(|&(n, v)| (n.to_string(), v)));
        constants.extend(
            spec.weights
                .iter()
                .enumerate()
                .map(|(i, &w)| (format!("WEIGHT_{i}"), w as f64)),
        );

        let device = &self.gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(spec.source),
            source: wgpu::ShaderSource::Wgsl(wgsl.as_str().into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&self.pipeline_layout),
            module: &module,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        });
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(GpuError::Pipeline {
                kernel: name.to_string(),
                message: e.to_string(),
            }
            .into());
        }

        let id = KernelId(self.kernels.len() as u32);
        debug!("instantiating kernel `{name}` ({}) as {:?}", spec.source, id);
        self.kernels.push(GpuKernel {
            name: name.to_string(),
            spec: spec.clone(),
            settings: *settings,
            output: settings.output,
            pipeline,
            targets: Vec::new(),
            next: 0,
        });
        Ok(id)
    }

    fn invoke(&mut self, kernel: KernelId, args: &[KernelArg<'_>]) -> Result<Texture> {
        let (width, height) = self.check(kernel, args)?;
        let params = KernelParams::pack((width, height), args).ok_or_else(|| {
            Error::InvalidArgument {
                kernel: self.kernels[kernel.0 as usize].name.clone(),
                reason: format!("more than {MAX_SCALAR_ARGUMENTS} scalar arguments"),
            }
        })?;
        let output = self.target(kernel, width, height);

        let device = &self.gpu.device;
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("kernel params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bytes_buffer = args.iter().find_map(|a| match a {
            KernelArg::Bytes(b) if !b.is_empty() => {
                // Storage buffers are read as u32 words.
                let mut padded = b.to_vec();
                padded.resize((b.len() + 3) / 4 * 4, 0);
                Some(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("kernel bytes"),
                    contents: &padded,
                    usage: wgpu::BufferUsages::STORAGE,
                }))
            }
            _ => None,
        });

        let inputs = KernelArg::textures(args)
            .map(|t| self.texture(t).map(|d| &d.view))
            .collect::<Result<Vec<_>>>()?;
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: PARAMS_BINDING,
            resource: params_buffer.as_entire_binding(),
        }];
        for i in 0..MAX_TEXTURE_ARGUMENTS {
            entries.push(wgpu::BindGroupEntry {
                binding: FIRST_TEXTURE_BINDING + i as u32,
                resource: wgpu::BindingResource::TextureView(
                    inputs.get(i).copied().unwrap_or(&self.placeholder),
                ),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: OUTPUT_BINDING,
            resource: wgpu::BindingResource::TextureView(&self.texture(output)?.view),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: BYTES_BINDING,
            resource: bytes_buffer
                .as_ref()
                .unwrap_or(&self.empty_bytes)
                .as_entire_binding(),
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel bind group"),
            layout: &self.layout,
            entries: &entries,
        });

        let k = &self.kernels[kernel.0 as usize];
        let (dx, dy) = self.gpu.workgroup_size.dispatch_size(width, height);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&k.name),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&k.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&k.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(dx, dy, 1);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        trace!("{} -> {width}×{height} ({dx}×{dy} workgroups)", k.name);
        Ok(output)
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
        let n = k.target_count();
        let last = k.targets.get((k.next + n - 1) % n).copied();
        let size = match k.output {
            OutputSize::Fixed { width, height } => Some((width, height)),
            _ => last.map(|t| t.size()),
        };
        let (width, height) = size.ok_or_else(|| Error::InvalidArgument {
            kernel: k.name.clone(),
            reason: "cannot clear a kernel without an output size".into(),
        })?;
        let recycle = k.settings.recycle_texture;

        let texture = match last {
            Some(t) if recycle && t.size() == (width, height) => t,
            Some(t) if recycle => {
                // Reallocate the most recent target at the new size.
                let texture = create_texture(&self.gpu.device, width, height, "texture");
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                self.slots[t.id.index as usize].content = Some(DeviceTexture {
                    texture,
                    view,
                    owner: Owner::Kernel(kernel),
                });
                let resized = Texture { id: t.id, width, height };
                let k = &mut self.kernels[kernel.0 as usize];
                if let Some(slot) = k.targets.iter_mut().find(|o| o.id == t.id) {
                    *slot = resized;
                }
                resized
            }
            _ => self.target(kernel, width, height),
        };
        let texels = vec![Rgba(color); texture.area()];
        self.write_texels(texture, &texels)?;
        Ok(texture)
    }

    fn upload(&mut self, width: u32, height: u32, texels: &[Rgba]) -> Result<Texture> {
        if texels.len() != width as usize * height as usize {
            return Err(Error::InvalidArgument {
                kernel: "upload".into(),
                reason: format!("{} texels for a {width}×{height} texture", texels.len()),
            });
        }
        let texture = self.insert(width, height, Owner::Caller);
        self.write_texels(texture, texels)?;
        Ok(texture)
    }

    fn release(&mut self, texture: Texture) -> Result<()> {
        let owner = self.texture(texture)?.owner;
        if let Owner::Kernel(k) = owner {
            return Err(Error::KernelOwnedTexture {
                texture: texture.id,
                kernel: self.kernels[k.0 as usize].name.clone(),
            });
        }
        let slot = &mut self.slots[texture.id.index as usize];
        if let Some(t) = slot.content.take() {
            t.texture.destroy();
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(texture.id.index);
        Ok(())
    }

    fn read_pixels(&mut self, texture: Texture) -> Result<Vec<u8>> {
        let readback = self.read_pixels_async(texture)?;
        self.wait_readback(readback)
    }

    fn read_pixels_async(&mut self, texture: Texture) -> Result<Readback> {
        let source = &self.texture(texture)?.texture;
        let (width, height) = texture.size();
        let row_bytes = padded_row_bytes(width);
        let device = &self.gpu.device;
        let staging = Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: (row_bytes * height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: source,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(row_bytes),
                    rows_per_image: Some(height),
                },
            },
            extent(width, height),
        );
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        let mapped = Arc::clone(&staging);
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let pixels = match result {
                    Ok(()) => {
                        let range = mapped.slice(..).get_mapped_range();
                        let pixels = quantise_rows(&range, width, height, row_bytes);
                        drop(range);
                        mapped.unmap();
                        Ok(pixels)
                    }
                    Err(e) => Err(Error::Readback(e.to_string())),
                };
                // The receiver may have been dropped by a cancelled download.
                let _ = tx.send(pixels);
            });
        Ok(Readback::from_receiver(rx))
    }

    fn wait_readback(&mut self, readback: Readback) -> Result<Vec<u8>> {
        if let Some(result) = readback.try_wait() {
            return result;
        }
        let _ = self.gpu.device.poll(wgpu::Maintain::Wait);
        readback.wait()
    }
}
