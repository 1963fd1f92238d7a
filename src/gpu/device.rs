// gpu/device.rs — wgpu adapter selection, device limits and workgroup sizing.
//
// ADAPTER SELECTION
// Vulkan only. Hardware adapters (discrete, integrated, virtual, "other")
// are preferred; a software rasteriser is taken only when nothing else is
// visible, and the choice is logged so a slow run is explained.
//
// PROFILES
// `DeviceProfile::Embedded` requests lower limits than the hardware has.
// wgpu validates every dispatch against the *requested* limits, so a
// workgroup or texture that would not fit a small board fails on the
// development machine too.
//
// WORKGROUP SIZE
// Kernels declare `override WORKGROUP_X` / `WORKGROUP_Y`. The values are
// passed as pipeline constants, so the WGSL text never changes with the
// profile.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on` to drive wgpu's async adapter/device requests on
//   the current thread.
// - `#[from]` on a `thiserror` variant: `?` converts the wgpu error.

use std::collections::HashMap;
use std::fmt;

use log::{info, warn};
use thiserror::Error;

/// Hardware profile controlling requested limits and the default workgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// The adapter's own limits.
    #[default]
    Native,
    /// Limits of a small embedded GPU (256 invocations per workgroup,
    /// 4096² textures).
    Embedded,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "native"),
            DeviceProfile::Embedded => write!(f, "embedded (capped limits)"),
        }
    }
}

/// 2D workgroup size for image kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Pipeline override constants for this size.
    pub fn as_constants(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("WORKGROUP_X".to_string(), self.x as f64),
            ("WORKGROUP_Y".to_string(), self.y as f64),
        ])
    }

    /// 16×8 on desktop GPUs (whole warps/wavefronts), 8×8 on embedded.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::Embedded => WorkgroupSize { x: 8, y: 8 },
        }
    }

    /// Workgroups needed to cover a `width`×`height` output.
    pub fn dispatch_size(&self, width: u32, height: u32) -> (u32, u32) {
        ((width + self.x - 1) / self.x, (height + self.y - 1) / self.y)
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Errors from device initialisation and pipeline creation.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no Vulkan adapter found")]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("workgroup size {total} exceeds the profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    /// Shader compilation or pipeline validation failed.
    #[error("kernel `{kernel}` failed to build: {message}")]
    Pipeline { kernel: String, message: String },
}

/// Adapter, device, queue and the active profile.
///
/// Fields drop top to bottom; the instance is last so it outlives the
/// device-level objects.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_name: String,
    pub workgroup_size: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    pub fn new() -> Result<Self, GpuError> {
        Self::with_profile(DeviceProfile::Native)
    }

    pub fn with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::init(profile))
    }

    async fn init(profile: DeviceProfile) -> Result<Self, GpuError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let mut adapters = instance.enumerate_adapters(wgpu::Backends::VULKAN);
        if adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }
        // Hardware first; software rasterisers sort last.
        adapters.sort_by_key(|a| a.get_info().device_type == wgpu::DeviceType::Cpu);
        let adapter = adapters.remove(0);
        let adapter_info = adapter.get_info();
        if adapter_info.device_type == wgpu::DeviceType::Cpu {
            warn!("only a software adapter is available: {}", adapter_info.name);
        }
        info!(
            "using adapter {} ({:?}, {:?}), profile {profile}",
            adapter_info.name, adapter_info.backend, adapter_info.device_type
        );

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("rudolf-kt"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_name: adapter_info.name,
            workgroup_size: WorkgroupSize::for_profile(profile),
            _instance: instance,
        })
    }

    /// Override the workgroup size, checked against the profile's limit.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        let total = x * y;
        let max = limits_for_profile(self.profile).max_compute_invocations_per_workgroup;
        if total > max {
            return Err(GpuError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}; workgroup {}]",
            self.adapter_name, self.profile, self.workgroup_size
        )
    }
}

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::Embedded => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_texture_dimension_2d: 4096,
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workgroup_constants() {
        let ws = WorkgroupSize { x: 16, y: 8 };
        assert_eq!(ws.total(), 128);
        let c = ws.as_constants();
        assert_eq!(c["WORKGROUP_X"], 16.0);
        assert_eq!(c["WORKGROUP_Y"], 8.0);
    }

    #[test]
    fn test_profile_defaults() {
        assert_eq!(WorkgroupSize::for_profile(DeviceProfile::Native).total(), 128);
        assert!(WorkgroupSize::for_profile(DeviceProfile::Embedded).total() <= 256);
    }

    #[test]
    fn test_dispatch_rounds_up() {
        let ws = WorkgroupSize { x: 8, y: 8 };
        assert_eq!(ws.dispatch_size(752, 480), (94, 60));
        assert_eq!(ws.dispatch_size(100, 100), (13, 13));
        assert_eq!(ws.dispatch_size(1, 1), (1, 1));
    }

    #[test]
    fn test_embedded_limits() {
        let limits = limits_for_profile(DeviceProfile::Embedded);
        assert_eq!(limits.max_compute_invocations_per_workgroup, 256);
        assert_eq!(limits.max_texture_dimension_2d, 4096);
        assert_eq!(limits_for_profile(DeviceProfile::Native), wgpu::Limits::default());
    }

    #[test]
    #[ignore = "requires a Vulkan GPU"]
    fn test_device_init() {
        let mut gpu = GpuDevice::new().unwrap();
        gpu.set_workgroup_size(8, 8).unwrap();
        assert!(gpu.set_workgroup_size(64, 64).is_err());
    }
}
