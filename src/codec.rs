// codec.rs — Keypoint codec: corner map ⇄ encoded texture ⇄ host keypoints.
//
// The codec owns the encoder program group, the current encoder length and
// the tuner that picks the offset-search limit.
//
//   encode    corner map  → encoded keypoint texture (kernel-owned)
//   download  encoded     → raw bytes on the host (timed, feeds the tuner)
//   decode    raw bytes   → Vec<Keypoint>
//   upload    &[Keypoint] → encoded keypoint texture
//
// The encoder texture is square. Its side is re-derived from the expected
// keypoint count by `optimize`, or grown (never shrunk) by `reserve_space`.
// An encoder that is too small drops the keypoints that do not fit. Only
// the host can tell, once the pixels are back: a full encoder has no room
// for the sentinel, so `decode` warns and flags it in the report.
//
// NEW RUST CONCEPTS:
// - `Option<&mut T>` for an optional out-parameter (the decode report).
// - `Box<Error>` inside an error variant to wrap a cause of the same type.
// - `bytemuck::cast_slice` to view a `Vec<UploadEntry>` as bytes with no
//   copy.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::backend::{ComputeBackend, KernelArg, KernelSettings, KernelSpec, Readback, Texture};
use crate::error::{Error, Result};
use crate::keypoint::{
    decode_coordinate, decode_lod, decode_rotation, decode_unit, pixels_per_keypoint,
    validate_descriptor_size, Keypoint, KeypointRecord, UploadEntry, MAX_DESCRIPTOR_SIZE,
    MAX_TEXTURE_LENGTH,
};
use crate::program::ProgramGroup;
use crate::tuner::{StochasticTuner, TunerConfig};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const MIN_ENCODER_LENGTH: u32 = 1;
pub const MAX_ENCODER_LENGTH: u32 = 300;

/// Largest keypoint count the biggest encoder holds at the largest
/// descriptor size.
pub const MAX_KEYPOINTS: usize = (MAX_ENCODER_LENGTH * MAX_ENCODER_LENGTH) as usize
    / (2 + MAX_DESCRIPTOR_SIZE / 4);

pub const INITIAL_ENCODER_LENGTH: u32 = 16;

/// Capacity of the host → device upload buffer, in keypoints.
pub const KEYPOINT_BUFFER_LENGTH: usize = 1024;

/// Smallest encoder side that holds `count` keypoints of the given
/// descriptor size, clamped to [MIN_ENCODER_LENGTH, MAX_ENCODER_LENGTH].
pub fn minimum_encoder_length(count: usize, descriptor_size: usize) -> u32 {
    let n = count.min(MAX_KEYPOINTS);
    let texels = (n * pixels_per_keypoint(descriptor_size)) as f64;
    (texels.sqrt().ceil() as u32).clamp(MIN_ENCODER_LENGTH, MAX_ENCODER_LENGTH)
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An encoded keypoint texture and how to read it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodedKeypoints {
    pub texture: Texture,
    pub encoder_length: u32,
    pub descriptor_size: usize,
    /// Exact number of keypoints, when known (uploads). Detector output
    /// only knows an upper bound, see `capacity`.
    pub count: Option<usize>,
}

impl EncodedKeypoints {
    /// Slots available in the texture.
    pub fn capacity(&self) -> usize {
        let side = self.encoder_length as usize;
        side * side / pixels_per_keypoint(self.descriptor_size)
    }
}

/// How `download` moves pixels to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transfer {
    /// Read back synchronously.
    #[default]
    Blocking,
    /// Request a readback and wait for it.
    Async,
    /// Return the pixels of the previous request and leave this one in
    /// flight. Results lag one call behind; the first call waits.
    AsyncBuffered,
}

/// Extra outputs of `decode`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeReport {
    /// Image size used to flag keypoints outside the image. Without it only
    /// coordinates beyond `MAX_TEXTURE_LENGTH` are flagged.
    pub extent: Option<(f32, f32)>,
    /// User data byte of each keypoint, as [0, 1].
    pub user_data: Vec<f32>,
    /// Per keypoint: marked as lost or outside the image.
    pub discard: Vec<bool>,
    pub discard_count: usize,
    /// No sentinel was found: every slot held a keypoint, so corners past
    /// the encoder's capacity may have been dropped.
    pub encoder_full: bool,
}

impl DecodeReport {
    pub fn with_extent(width: f32, height: f32) -> Self {
        DecodeReport {
            extent: Some((width, height)),
            ..Default::default()
        }
    }

    fn is_outside(&self, x: f32, y: f32) -> bool {
        let (w, h) = self.extent.unwrap_or((MAX_TEXTURE_LENGTH, MAX_TEXTURE_LENGTH));
        x > MAX_TEXTURE_LENGTH || y > MAX_TEXTURE_LENGTH || x >= w || y >= h
    }
}

/// Codec configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfig {
    /// Download timings are not fed to the tuner before this has elapsed
    /// since construction (start-up noise).
    pub warm_up: Duration,
    pub tuner: TunerConfig,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            warm_up: Duration::from_secs(2),
            tuner: TunerConfig::default(),
        }
    }
}

/// A download that has been requested but not yet collected.
pub struct PendingDownload {
    readback: Readback,
    started: Instant,
}

// ---------------------------------------------------------------------------
// KeypointCodec
// ---------------------------------------------------------------------------

pub struct KeypointCodec {
    program: ProgramGroup,
    tuner: StochasticTuner,
    config: CodecConfig,
    encoder_length: u32,
    spawned_at: Instant,
    upload_buffer: Option<Vec<UploadEntry>>,
    in_flight: Option<PendingDownload>,
}

impl Default for KeypointCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl KeypointCodec {
    pub fn new(config: CodecConfig) -> Self {
        let initial = KernelSettings::has_texture_size(INITIAL_ENCODER_LENGTH, INITIAL_ENCODER_LENGTH);
        let mut program = ProgramGroup::new("encoders");
        program
            .declare(
                "encodeKeypointOffsets",
                KernelSpec::new("encoders/encode-keypoint-offsets")
                    .with_arguments(&["corners", "maxIterations"]),
                KernelSettings::default(),
            )
            .declare(
                "encodeKeypoints",
                KernelSpec::new("encoders/encode-keypoints").with_arguments(&[
                    "offsetsImage",
                    "encoderLength",
                    "descriptorSize",
                ]),
                initial,
            )
            .declare(
                "downloadKeypoints",
                KernelSpec::new("utils/identity").with_arguments(&["encodedKeypoints"]),
                initial,
            )
            .declare(
                "uploadKeypoints",
                KernelSpec::new("encoders/upload-keypoints").with_arguments(&[
                    "keypoints",
                    "keypointCount",
                    "encoderLength",
                    "descriptorSize",
                ]),
                initial,
            );
        KeypointCodec {
            program,
            tuner: StochasticTuner::new(config.tuner.clone()),
            config,
            encoder_length: INITIAL_ENCODER_LENGTH,
            spawned_at: Instant::now(),
            upload_buffer: None,
            in_flight: None,
        }
    }

    pub fn encoder_length(&self) -> u32 {
        self.encoder_length
    }

    /// Keypoint slots in the current encoder.
    pub fn capacity(&self, descriptor_size: usize) -> usize {
        let side = self.encoder_length as usize;
        side * side / pixels_per_keypoint(descriptor_size)
    }

    pub fn tuner(&self) -> &StochasticTuner {
        &self.tuner
    }

    pub fn tuner_mut(&mut self) -> &mut StochasticTuner {
        &mut self.tuner
    }

    /// Size the encoder for `count` keypoints. Returns whether the length
    /// changed.
    pub fn optimize(&mut self, count: usize, descriptor_size: usize) -> bool {
        validate_descriptor_size(descriptor_size);
        let old = self.encoder_length;
        self.encoder_length = minimum_encoder_length(count, descriptor_size);
        if old != self.encoder_length {
            debug!(
                "encoder length {old} -> {} for {count} keypoints",
                self.encoder_length
            );
        }
        old != self.encoder_length
    }

    /// Grow the encoder if `count` keypoints would not fit. Never shrinks.
    pub fn reserve_space(&mut self, count: usize, descriptor_size: usize) -> bool {
        validate_descriptor_size(descriptor_size);
        if minimum_encoder_length(count, descriptor_size) > self.encoder_length {
            self.optimize(count, descriptor_size)
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Encode
    // -----------------------------------------------------------------------

    /// Encode a corner map using the tuner's current search limit.
    pub fn encode(
        &mut self,
        backend: &mut dyn ComputeBackend,
        corners: Texture,
        descriptor_size: usize,
    ) -> Result<EncodedKeypoints> {
        let max_iterations = self.tuner.current_value() as u32;
        self.encode_with(backend, corners, descriptor_size, max_iterations)
    }

    /// Encode a corner map with an explicit offset-search limit.
    ///
    /// # Panics
    /// Panics if `max_iterations` is outside [1, 255] or the descriptor size
    /// is invalid.
    pub fn encode_with(
        &mut self,
        backend: &mut dyn ComputeBackend,
        corners: Texture,
        descriptor_size: usize,
        max_iterations: u32,
    ) -> Result<EncodedKeypoints> {
        assert!(
            (1..=255).contains(&max_iterations),
            "max_iterations must be in [1, 255], got {max_iterations}"
        );
        validate_descriptor_size(descriptor_size);
        let length = self.encoder_length;

        let offsets = self.program.call(
            backend,
            "encodeKeypointOffsets",
            &[KernelArg::Texture(corners), KernelArg::Int(max_iterations as i32)],
        )?;
        self.program.resize(backend, "encodeKeypoints", length, length)?;
        self.program.clear(backend, "encodeKeypoints", [0.0; 4])?;
        let texture = self.program.call(
            backend,
            "encodeKeypoints",
            &[
                KernelArg::Texture(offsets),
                KernelArg::Int(length as i32),
                KernelArg::Int(descriptor_size as i32),
            ],
        )?;
        Ok(EncodedKeypoints {
            texture,
            encoder_length: length,
            descriptor_size,
            count: None,
        })
    }

    // -----------------------------------------------------------------------
    // Decode
    // -----------------------------------------------------------------------

    /// Parse downloaded pixels into keypoints.
    ///
    /// Stops at the sentinel or the end of the buffer. All-zero slots are
    /// leftovers of the cleared encoder and are skipped. Decoding nothing
    /// after the tuner has settled restarts the tuner, since its chosen
    /// value may have been measured on a very different workload.
    pub fn decode(
        &mut self,
        pixels: &[u8],
        descriptor_size: usize,
        mut report: Option<&mut DecodeReport>,
    ) -> Vec<Keypoint> {
        validate_descriptor_size(descriptor_size);
        let stride = 4 * pixels_per_keypoint(descriptor_size);
        if let Some(r) = report.as_deref_mut() {
            r.user_data.clear();
            r.discard.clear();
            r.discard_count = 0;
            r.encoder_full = false;
        }

        let mut keypoints = Vec::new();
        let mut terminated = false;
        for slot in pixels.chunks_exact(stride) {
            let rec = KeypointRecord::read(slot);
            if rec.is_sentinel() {
                terminated = true;
                break;
            }
            if rec.is_noise() {
                continue;
            }
            let lod = decode_lod(rec.lod);
            let keypoint = Keypoint {
                x: decode_coordinate(rec.x),
                y: decode_coordinate(rec.y),
                lod,
                rotation: lod.map_or(0.0, |_| decode_rotation(rec.rotation)),
                score: decode_unit(rec.score),
                descriptor: (descriptor_size > 0).then(|| {
                    slot[KeypointRecord::LEN..KeypointRecord::LEN + descriptor_size].to_vec()
                }),
                user_data: Some(decode_unit(rec.user_data)),
            };
            if let Some(r) = report.as_deref_mut() {
                let discard = rec.is_discarded() || r.is_outside(keypoint.x, keypoint.y);
                r.user_data.push(decode_unit(rec.user_data));
                r.discard.push(discard);
                r.discard_count += discard as usize;
            }
            keypoints.push(keypoint);
        }

        if !terminated && !keypoints.is_empty() {
            warn!(
                "encoder full at {} keypoints, corners past its capacity were dropped; \
                 grow it with optimize or reserve_space",
                keypoints.len()
            );
            if let Some(r) = report.as_deref_mut() {
                r.encoder_full = true;
            }
        }

        if keypoints.is_empty() && self.tuner.finished() {
            self.tuner.reset();
        }
        keypoints
    }

    // -----------------------------------------------------------------------
    // Download
    // -----------------------------------------------------------------------

    /// Copy the encoded texture into the download kernel's buffer and start
    /// a readback.
    pub fn request_download(
        &mut self,
        backend: &mut dyn ComputeBackend,
        encoded: &EncodedKeypoints,
    ) -> Result<PendingDownload> {
        let length = encoded.encoder_length;
        self.program.resize(backend, "downloadKeypoints", length, length)?;
        let copy = self.program.call(
            backend,
            "downloadKeypoints",
            &[KernelArg::Texture(encoded.texture)],
        )?;
        let started = Instant::now();
        let readback = backend.read_pixels_async(copy)?;
        Ok(PendingDownload { readback, started })
    }

    /// Wait for a requested download and feed its latency to the tuner.
    pub fn complete_download(
        &mut self,
        backend: &mut dyn ComputeBackend,
        pending: PendingDownload,
    ) -> Result<Vec<u8>> {
        let pixels = backend.wait_readback(pending.readback)?;
        self.observe(pending.started.elapsed());
        Ok(pixels)
    }

    /// Download an encoded keypoint texture to the host.
    pub fn download(
        &mut self,
        backend: &mut dyn ComputeBackend,
        encoded: &EncodedKeypoints,
        transfer: Transfer,
    ) -> Result<Vec<u8>> {
        self.transfer(backend, encoded, transfer)
            .map_err(|e| Error::Download(Box::new(e)))
    }

    fn transfer(
        &mut self,
        backend: &mut dyn ComputeBackend,
        encoded: &EncodedKeypoints,
        transfer: Transfer,
    ) -> Result<Vec<u8>> {
        match transfer {
            Transfer::Blocking => {
                let length = encoded.encoder_length;
                self.program.resize(backend, "downloadKeypoints", length, length)?;
                let copy = self.program.call(
                    backend,
                    "downloadKeypoints",
                    &[KernelArg::Texture(encoded.texture)],
                )?;
                let started = Instant::now();
                let pixels = backend.read_pixels(copy)?;
                self.observe(started.elapsed());
                Ok(pixels)
            }
            Transfer::Async => {
                let pending = self.request_download(backend, encoded)?;
                self.complete_download(backend, pending)
            }
            Transfer::AsyncBuffered => {
                let previous = match self.in_flight.take() {
                    Some(p) => p,
                    None => self.request_download(backend, encoded)?,
                };
                let pixels = self.complete_download(backend, previous)?;
                self.in_flight = Some(self.request_download(backend, encoded)?);
                Ok(pixels)
            }
        }
    }

    fn observe(&mut self, elapsed: Duration) {
        if self.spawned_at.elapsed() >= self.config.warm_up {
            self.tuner.feed_observation(elapsed.as_secs_f64() * 1000.0);
        }
    }

    /// Drop a buffered download that is still in flight.
    pub fn cancel_buffered(&mut self) {
        self.in_flight = None;
    }

    // -----------------------------------------------------------------------
    // Upload
    // -----------------------------------------------------------------------

    /// Encode host keypoints into a texture. Only position, lod and score
    /// are transferred; lists longer than `KEYPOINT_BUFFER_LENGTH` are
    /// truncated. The encoder grows to fit the list plus a sentinel.
    pub fn upload(
        &mut self,
        backend: &mut dyn ComputeBackend,
        keypoints: &[Keypoint],
        descriptor_size: usize,
    ) -> Result<EncodedKeypoints> {
        validate_descriptor_size(descriptor_size);
        if keypoints.len() > KEYPOINT_BUFFER_LENGTH {
            warn!(
                "uploading {} keypoints, only the first {KEYPOINT_BUFFER_LENGTH} are kept",
                keypoints.len()
            );
        }
        let count = keypoints.len().min(KEYPOINT_BUFFER_LENGTH);

        let buffer = self
            .upload_buffer
            .get_or_insert_with(|| Vec::with_capacity(KEYPOINT_BUFFER_LENGTH));
        buffer.clear();
        buffer.extend(keypoints[..count].iter().map(UploadEntry::from));

        // One spare slot keeps the sentinel, so an upload never reads back
        // as a full encoder.
        self.reserve_space(count + 1, descriptor_size);
        let length = self.encoder_length;
        self.program.resize(backend, "uploadKeypoints", length, length)?;

        let bytes: &[u8] = match &self.upload_buffer {
            Some(b) => bytemuck::cast_slice(b),
            None => &[],
        };
        let texture = self.program.call(
            backend,
            "uploadKeypoints",
            &[
                KernelArg::Bytes(bytes),
                KernelArg::Int(count as i32),
                KernelArg::Int(length as i32),
                KernelArg::Int(descriptor_size as i32),
            ],
        )?;
        Ok(EncodedKeypoints {
            texture,
            encoder_length: length,
            descriptor_size,
            count: Some(count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;

    fn pixels_with(records: &[KeypointRecord], ds: usize, side: usize) -> Vec<u8> {
        let stride = 4 * pixels_per_keypoint(ds);
        let mut bytes = vec![0u8; side * side * 4];
        for (i, r) in records.iter().enumerate() {
            r.write(&mut bytes[i * stride..]);
        }
        bytes
    }

    #[test]
    fn test_max_keypoints() {
        assert_eq!(MAX_KEYPOINTS, 5000);
    }

    #[test]
    fn test_minimum_encoder_length_example() {
        assert_eq!(minimum_encoder_length(37, 32), 20);
        assert_eq!(minimum_encoder_length(0, 0), 1);
        assert_eq!(minimum_encoder_length(1_000_000, 64), 300);
    }

    #[test]
    fn test_reserve_space_never_shrinks() {
        let mut codec = KeypointCodec::default();
        assert!(codec.optimize(37, 32));
        assert_eq!(codec.encoder_length(), 20);
        assert!(!codec.reserve_space(10, 32));
        assert!(!codec.reserve_space(37, 32));
        assert_eq!(codec.encoder_length(), 20);
        // 41 × 10 texels needs a side of 21.
        assert!(codec.reserve_space(41, 32));
        assert_eq!(codec.encoder_length(), 21);
    }

    #[test]
    fn test_decode_stops_at_sentinel_and_skips_noise() {
        let mut codec = KeypointCodec::default();
        let a = KeypointRecord::from_keypoint(&Keypoint::new(3.0, 4.0, 0.5));
        let b = KeypointRecord::from_keypoint(&Keypoint::new(5.0, 6.0, 1.0));
        let records = [a, KeypointRecord::default(), b, KeypointRecord::SENTINEL, a];
        let kps = codec.decode(&pixels_with(&records, 0, 4), 0, None);
        assert_eq!(kps.len(), 2);
        assert_eq!((kps[1].x, kps[1].y), (5.0, 6.0));
    }

    #[test]
    fn test_decode_rotation_requires_lod() {
        let mut codec = KeypointCodec::default();
        let mut kp = Keypoint::new(3.0, 4.0, 0.5);
        kp.rotation = 1.0;
        let no_lod = KeypointRecord::from_keypoint(&kp);
        let with_lod = KeypointRecord::from_keypoint(&kp.clone().with_lod(1.0));
        let kps = codec.decode(&pixels_with(&[no_lod, with_lod], 0, 4), 0, None);
        assert_eq!(kps[0].rotation, 0.0);
        assert!((kps[1].rotation - 1.0).abs() < 0.02);
    }

    #[test]
    fn test_decode_report_flags_discards() {
        let mut codec = KeypointCodec::default();
        let inside = KeypointRecord::from_keypoint(&Keypoint::new(3.0, 4.0, 0.5));
        let outside = KeypointRecord::from_keypoint(&Keypoint::new(30.0, 4.0, 0.5));
        let mut lost = inside;
        lost.discard();
        let mut report = DecodeReport::with_extent(20.0, 20.0);
        let kps = codec.decode(
            &pixels_with(&[inside, outside, lost], 0, 4),
            0,
            Some(&mut report),
        );
        assert_eq!(kps.len(), 3);
        assert_eq!(report.discard, vec![false, true, true]);
        assert_eq!(report.discard_count, 2);
    }

    #[test]
    fn test_decode_descriptor_bytes() {
        let mut codec = KeypointCodec::default();
        let mut bytes = pixels_with(
            &[KeypointRecord::from_keypoint(&Keypoint::new(1.0, 1.0, 1.0))],
            4,
            4,
        );
        bytes[8..12].copy_from_slice(&[1, 2, 3, 4]);
        let kps = codec.decode(&bytes, 4, None);
        assert_eq!(kps[0].descriptor.as_deref(), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn test_empty_decode_resets_finished_tuner() {
        let mut codec = KeypointCodec::new(CodecConfig {
            tuner: TunerConfig {
                seed: Some(1),
                ..TunerConfig::default()
            },
            ..CodecConfig::default()
        });
        while !codec.tuner().finished() {
            codec.tuner_mut().feed_observation(1.0);
        }
        let empty = pixels_with(&[KeypointRecord::SENTINEL], 0, 2);
        assert!(codec.decode(&empty, 0, None).is_empty());
        assert!(!codec.tuner().finished());
    }

    #[test]
    fn test_upload_download_roundtrip() {
        let mut cpu = CpuBackend::new();
        let mut codec = KeypointCodec::default();
        let input: Vec<Keypoint> = (0..40)
            .map(|i| Keypoint::new(i as f32 * 1.5 + 0.25, 100.0 - i as f32, 0.5).with_lod(1.0))
            .collect();
        let encoded = codec.upload(&mut cpu, &input, 0).unwrap();
        assert_eq!(encoded.count, Some(40));
        assert!(encoded.capacity() >= 40);
        let pixels = codec.download(&mut cpu, &encoded, Transfer::Blocking).unwrap();
        let out = codec.decode(&pixels, 0, None);
        assert_eq!(out.len(), 40);
        for (a, b) in input.iter().zip(&out) {
            assert!((a.x - b.x).abs() <= 0.0625 && (a.y - b.y).abs() <= 0.0625);
            assert!((a.score - b.score).abs() <= 1.0 / 255.0);
            assert!((a.lod.unwrap() - b.lod.unwrap()).abs() < 0.015);
        }
    }

    #[test]
    fn test_download_failure_is_wrapped() {
        let mut cpu = CpuBackend::new();
        let mut codec = KeypointCodec::default();
        let encoded = codec.upload(&mut cpu, &[Keypoint::new(1.0, 1.0, 1.0)], 0).unwrap();
        cpu.fail_next_readback();
        let err = codec.download(&mut cpu, &encoded, Transfer::Async).unwrap_err();
        assert!(matches!(err, Error::Download(_)));
        assert!(err.is_transient());
    }

    #[test]
    #[should_panic(expected = "max_iterations")]
    fn test_encode_with_rejects_zero_iterations() {
        let mut cpu = CpuBackend::new();
        let mut codec = KeypointCodec::default();
        let t = cpu.upload(1, 1, &[crate::image::Rgba::ZERO]).unwrap();
        let _ = codec.encode_with(&mut cpu, t, 0, 0);
    }
}
