// error.rs — Error taxonomy for the compute core.
//
// Three kinds of failure reach a caller:
//
//   1. Misuse detected by the backend (wrong argument count, a released
//      handle, an unknown kernel source). These are bugs in the caller but
//      are reported as `Err` so a host application can log and bail out.
//   2. Transient resource failures (readback, lost context). The caller may
//      retry the frame. `Error::is_transient()` tells them apart.
//   3. GPU initialisation errors (feature `gpu`), folded in via `#[from]`.
//
// Contract violations that can only come from programmer error
// (undeclared kernel names, invalid descriptor sizes) panic instead. Data
// quality conditions (out-of-bounds keypoints, encoder noise) are never
// errors: they are flagged or skipped during decoding.

use thiserror::Error;

use crate::backend::TextureId;

/// Errors surfaced by the compute backends and the algorithms above them.
#[derive(Debug, Error)]
pub enum Error {
    /// The handle refers to a texture that was already released (or its
    /// slot has since been reused by a newer texture).
    #[error("texture {0:?} has been released")]
    ReleasedTexture(TextureId),

    /// The caller tried to release a texture owned by a recycling kernel.
    #[error("texture {texture:?} is owned by kernel `{kernel}` and cannot be released")]
    KernelOwnedTexture { texture: TextureId, kernel: String },

    /// The backend has no implementation for the requested kernel source.
    #[error("unsupported kernel source `{0}`")]
    UnsupportedKernel(String),

    /// Wrong number of arguments passed to a kernel.
    #[error("kernel `{kernel}` expects {expected} arguments, got {got}")]
    ArgumentMismatch {
        kernel: String,
        expected: usize,
        got: usize,
    },

    /// An argument has the wrong type or an out-of-range value.
    #[error("kernel `{kernel}`: {reason}")]
    InvalidArgument { kernel: String, reason: String },

    /// A kernel without ping-pong rendering was asked to read the buffer
    /// it is about to write.
    #[error("kernel `{0}` cannot read its own output without ping-pong rendering")]
    SelfRead(String),

    /// Transferring pixels back to host memory failed.
    #[error("readback failed: {0}")]
    Readback(String),

    /// A keypoint download failed. Wraps the underlying cause.
    #[error("can't download encoded keypoint texture")]
    Download(#[source] Box<Error>),

    /// The device went away (driver reset, device lost, channel closed).
    #[error("compute context lost")]
    ContextLost,

    #[cfg(feature = "gpu")]
    #[error(transparent)]
    Gpu(#[from] crate::gpu::device::GpuError),
}

impl Error {
    /// `true` for failures where retrying the frame is reasonable.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Readback(_) | Error::ContextLost => true,
            Error::Download(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn download_wraps_cause() {
        let err = Error::Download(Box::new(Error::Readback("map failed".into())));
        assert_eq!(err.to_string(), "can't download encoded keypoint texture");
        let source = err.source().expect("download error keeps its cause");
        assert_eq!(source.to_string(), "readback failed: map failed");
        assert!(err.is_transient());
    }

    #[test]
    fn misuse_is_not_transient() {
        let err = Error::ArgumentMismatch {
            kernel: "scanMax".into(),
            expected: 2,
            got: 1,
        };
        assert!(!err.is_transient());
        assert!(Error::ContextLost.is_transient());
    }
}
