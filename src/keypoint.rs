// keypoint.rs — Keypoint model and the byte-level wire format.
//
// An encoded keypoint is a run of RGBA texels in a square texture:
//
//   texel 0: [ x lo | x hi | y lo | y hi ]      fixed point, FIX_RESOLUTION
//   texel 1: [ lod  | rot  | score| user ]      lod 255 = "no lod"
//   texel 2..: descriptor bytes, 4 per texel
//
// The list ends with a sentinel header x = y = 0xFFFF. Every kernel that
// reads or writes keypoints goes through `KeypointRecord` so the layout is
// defined in exactly one place.
//
// NEW RUST CONCEPTS:
// - `u16::from_le_bytes` / `to_le_bytes` for explicit little-endian packing.
// - `Option<f32>` for fields that are absent rather than zero (lod, user data).
// - Associated constants (`KeypointRecord::SENTINEL`).

use std::f32::consts::PI;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Fractional bits of the fixed-point coordinate encoding.
pub const FIX_BITS: u32 = 3;

/// Fixed-point scale: encoded = round(coordinate * FIX_RESOLUTION).
pub const FIX_RESOLUTION: f32 = (1 << FIX_BITS) as f32;

/// Largest image side whose coordinates survive the 16-bit encoding.
pub const MAX_TEXTURE_LENGTH: f32 = ((1u32 << (16 - FIX_BITS)) - 1) as f32;

/// Deepest pyramid the detectors and tracker will build.
pub const PYRAMID_MAX_LEVELS: usize = 5;

/// log2 of the largest upscale factor the lod code can express.
pub const LOG2_PYRAMID_MAX_SCALE: f32 = 2.0;

/// Descriptor sizes are multiples of 4 and never exceed this.
pub const MAX_DESCRIPTOR_SIZE: usize = 64;

/// Header texels per keypoint (position + properties).
pub const HEADER_PIXELS: usize = 2;

/// Lod code meaning "detected at a single scale".
pub const NO_LOD: u8 = 255;

/// Fixed-point value written by the sentinel texel.
pub const SENTINEL_COORD: u16 = 0xFFFF;

/// Fixed-point value written for keypoints the tracker lost. Decodes to a
/// coordinate beyond `MAX_TEXTURE_LENGTH`, so it is always flagged.
pub const DISCARD_COORD: u16 = 0xFFFE;

// ---------------------------------------------------------------------------
// Keypoint
// ---------------------------------------------------------------------------

/// A decoded keypoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoint {
    /// Column, sub-pixel, level-0 coordinates.
    pub x: f32,
    /// Row, sub-pixel, level-0 coordinates.
    pub y: f32,
    /// Pyramid level of detail. `None` for single-scale detections.
    pub lod: Option<f32>,
    /// Orientation in radians, [-π, π]. Only meaningful when `lod` is set.
    pub rotation: f32,
    /// Normalised corner score in [0, 1].
    pub score: f32,
    /// Raw descriptor bytes (`None` when the descriptor size is 0).
    pub descriptor: Option<Vec<u8>>,
    /// Generic per-keypoint byte, normalised to [0, 1].
    pub user_data: Option<f32>,
}

impl Keypoint {
    /// A keypoint with only a position and score.
    pub fn new(x: f32, y: f32, score: f32) -> Self {
        Keypoint {
            x,
            y,
            lod: None,
            rotation: 0.0,
            score,
            descriptor: None,
            user_data: None,
        }
    }

    /// Builder-style lod setter.
    pub fn with_lod(mut self, lod: f32) -> Self {
        self.lod = Some(lod);
        self
    }

    /// Squared euclidean distance to another keypoint, in pixels².
    pub fn distance_sq(&self, other: &Keypoint) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

// ---------------------------------------------------------------------------
// Size helpers
// ---------------------------------------------------------------------------

/// Texels occupied by one keypoint with the given descriptor size.
pub fn pixels_per_keypoint(descriptor_size: usize) -> usize {
    HEADER_PIXELS + (descriptor_size + 3) / 4
}

/// Validate a descriptor size.
///
/// # Panics
/// Panics unless `descriptor_size` is a multiple of 4 and at most
/// `MAX_DESCRIPTOR_SIZE`. Passing anything else is a programming error.
pub fn validate_descriptor_size(descriptor_size: usize) {
    assert!(
        descriptor_size % 4 == 0 && descriptor_size <= MAX_DESCRIPTOR_SIZE,
        "invalid descriptor size {descriptor_size}: must be a multiple of 4 and <= {MAX_DESCRIPTOR_SIZE}"
    );
}

// ---------------------------------------------------------------------------
// Field codecs
// ---------------------------------------------------------------------------

/// Encode a coordinate as 16-bit fixed point. Negative values clamp to 0;
/// values too large for the format clamp to the discard marker so they can
/// never be mistaken for the sentinel.
#[inline]
pub fn encode_coordinate(v: f32) -> u16 {
    (v * FIX_RESOLUTION).round().clamp(0.0, DISCARD_COORD as f32) as u16
}

#[inline]
pub fn decode_coordinate(v: u16) -> f32 {
    v as f32 / FIX_RESOLUTION
}

/// Encode a level of detail. `None` maps to `NO_LOD`; valid lods never
/// produce 255.
#[inline]
pub fn encode_lod(lod: Option<f32>) -> u8 {
    match lod {
        None => NO_LOD,
        Some(l) if l.is_nan() => NO_LOD,
        Some(l) => {
            let range = LOG2_PYRAMID_MAX_SCALE + PYRAMID_MAX_LEVELS as f32;
            let code = (l + LOG2_PYRAMID_MAX_SCALE) * 255.0 / range;
            code.round().clamp(0.0, (NO_LOD - 1) as f32) as u8
        }
    }
}

/// Decode a lod byte: `-L + (L + M) * byte / 255`, or `None` for 255.
#[inline]
pub fn decode_lod(code: u8) -> Option<f32> {
    if code == NO_LOD {
        return None;
    }
    let range = LOG2_PYRAMID_MAX_SCALE + PYRAMID_MAX_LEVELS as f32;
    Some(-LOG2_PYRAMID_MAX_SCALE + range * code as f32 / 255.0)
}

/// Map [-π, π] onto [0, 255].
#[inline]
pub fn encode_rotation(radians: f32) -> u8 {
    let t = ((radians / PI) + 1.0) * 0.5;
    (t * 255.0).round().clamp(0.0, 255.0) as u8
}

#[inline]
pub fn decode_rotation(code: u8) -> f32 {
    ((2.0 * code as f32 / 255.0) - 1.0) * PI
}

/// Map a [0, 1] value onto a byte. Also used for user data.
#[inline]
pub fn encode_unit(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[inline]
pub fn decode_unit(code: u8) -> f32 {
    code as f32 / 255.0
}

// ---------------------------------------------------------------------------
// KeypointRecord: the raw 8-byte header
// ---------------------------------------------------------------------------

/// The two header texels of an encoded keypoint, as raw integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeypointRecord {
    pub x: u16,
    pub y: u16,
    pub lod: u8,
    pub rotation: u8,
    pub score: u8,
    pub user_data: u8,
}

impl KeypointRecord {
    /// End-of-list marker.
    pub const SENTINEL: KeypointRecord = KeypointRecord {
        x: SENTINEL_COORD,
        y: SENTINEL_COORD,
        lod: 0,
        rotation: 0,
        score: 0,
        user_data: 0,
    };

    /// Header length in bytes.
    pub const LEN: usize = HEADER_PIXELS * 4;

    /// Quantise a keypoint's header fields. The descriptor is not part of
    /// the record.
    pub fn from_keypoint(kp: &Keypoint) -> Self {
        KeypointRecord {
            x: encode_coordinate(kp.x),
            y: encode_coordinate(kp.y),
            lod: encode_lod(kp.lod),
            rotation: encode_rotation(kp.rotation),
            score: encode_unit(kp.score),
            user_data: kp.user_data.map(encode_unit).unwrap_or(0),
        }
    }

    /// Read a header from the first 8 bytes of `bytes`.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than 8.
    pub fn read(bytes: &[u8]) -> Self {
        KeypointRecord {
            x: u16::from_le_bytes([bytes[0], bytes[1]]),
            y: u16::from_le_bytes([bytes[2], bytes[3]]),
            lod: bytes[4],
            rotation: bytes[5],
            score: bytes[6],
            user_data: bytes[7],
        }
    }

    /// Write the header into the first 8 bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.x.to_le_bytes());
        out[2..4].copy_from_slice(&self.y.to_le_bytes());
        out[4] = self.lod;
        out[5] = self.rotation;
        out[6] = self.score;
        out[7] = self.user_data;
    }

    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.x >= SENTINEL_COORD && self.y >= SENTINEL_COORD
    }

    /// Marked as lost by the tracker.
    #[inline]
    pub fn is_discarded(&self) -> bool {
        !self.is_sentinel() && (self.x >= DISCARD_COORD || self.y >= DISCARD_COORD)
    }

    /// An all-zero slot left behind by a cleared encoder texture.
    ///
    /// This is a heuristic: a genuine keypoint at (0, 0) with zero score and
    /// rotation bytes is indistinguishable from it and is skipped too.
    #[inline]
    pub fn is_noise(&self) -> bool {
        self.x as u32 + self.y as u32 == 0 && self.score as u32 + self.rotation as u32 == 0
    }

    /// Replace the position with the lost-keypoint marker, keeping the
    /// remaining fields.
    pub fn discard(&mut self) {
        self.x = DISCARD_COORD;
        self.y = DISCARD_COORD;
    }

    pub fn position(&self) -> (f32, f32) {
        (decode_coordinate(self.x), decode_coordinate(self.y))
    }

    pub fn set_position(&mut self, x: f32, y: f32) {
        self.x = encode_coordinate(x);
        self.y = encode_coordinate(y);
    }
}

// ---------------------------------------------------------------------------
// UploadEntry: host → device transfer layout
// ---------------------------------------------------------------------------

/// One keypoint in the upload buffer: `vec4(x, y, lod, score)`.
/// A NaN lod means "no lod". Rotation and descriptor are not transferred.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UploadEntry {
    pub x: f32,
    pub y: f32,
    pub lod: f32,
    pub score: f32,
}

impl UploadEntry {
    pub const SIZE: usize = std::mem::size_of::<UploadEntry>();

    pub fn lod(&self) -> Option<f32> {
        (!self.lod.is_nan()).then_some(self.lod)
    }
}

impl From<&Keypoint> for UploadEntry {
    fn from(kp: &Keypoint) -> Self {
        UploadEntry {
            x: kp.x,
            y: kp.y,
            lod: kp.lod.unwrap_or(f32::NAN),
            score: kp.score,
        }
    }
}
