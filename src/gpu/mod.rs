// gpu/mod.rs — wgpu implementation of `ComputeBackend` (feature `gpu`).
//
// `device` picks an adapter and sets limits; `backend` turns kernel specs
// into compute pipelines and runs them on rgba32float textures. The WGSL
// itself is supplied by the application, registered under the same source
// keys the CPU backend implements (`"trackers/lk"`, ...).
//
// The CPU backend stays the reference: a kernel's WGSL should reproduce its
// `cpu::` counterpart up to float rounding.

pub mod backend;
pub mod device;

pub use backend::WgpuBackend;
pub use device::{DeviceProfile, GpuDevice, GpuError, WorkgroupSize};
