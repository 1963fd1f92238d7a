// rudolf-kt: keypoint detection, encoding and tracking on a compute backend
//
// Harris corners and pyramidal Lucas-Kanade tracking written against a
// small `ComputeBackend` trait, with keypoints exchanged between kernels and
// the host through a compact texture encoding.
//
// Layers, bottom up:
//   image, error, keypoint         host types and the keypoint wire format
//   backend, cpu, gpu              the compute contract and its backends
//   program, arena                 named kernel groups, texture ownership
//   tuner, codec                   encode/decode/upload/download of keypoints
//   pyramid, harris, klt, colors   the algorithms
//   frontend                       the per-frame detect/track loop

pub mod image;
pub mod error;
pub mod keypoint;
pub mod backend;
pub mod cpu;
pub mod program;
pub mod arena;
pub mod tuner;
pub mod codec;
pub mod pyramid;
pub mod harris;
pub mod klt;
pub mod colors;
pub mod frontend;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use backend::{ComputeBackend, KernelArg, KernelSettings, KernelSpec, Texture};
pub use codec::{EncodedKeypoints, KeypointCodec};
pub use error::{Error, Result};
pub use keypoint::Keypoint;
