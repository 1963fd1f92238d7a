// frontend.rs — Frame-by-frame detect/track/replenish loop.
//
// The loop a visual odometry backend calls once per camera frame:
//
//   1. Upload the frame, build the tracking pyramid
//   2. If keypoints survive from the previous frame → track them with LK,
//      download, decode, drop the discarded ones
//   3. Too few left → run Harris, decode the candidates and add the
//      strongest ones that are not too close to a kept keypoint
//   4. Size the encoder for the next detection
//   5. Upload the accepted set for the next frame, keep this pyramid,
//      release everything else
//
// Textures that live across frames (the pyramid) are parked in a
// `TextureArena`; the previous keypoints live in the codec's upload kernel
// output, which is only overwritten by the next upload in step 5.
//
// NEW RUST CONCEPTS:
// - Returning `(&[Keypoint], FrameStats)`: the slice borrows `self`, so the
//   caller must finish with it before processing the next frame.
// - `std::time::Instant` for per-stage timings.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::arena::{Purpose, TextureArena};
use crate::backend::{upload_grey, ComputeBackend, Texture};
use crate::codec::{CodecConfig, DecodeReport, EncodedKeypoints, KeypointCodec, Transfer};
use crate::error::Result;
use crate::harris::HarrisDetector;
use crate::image::Image;
use crate::keypoint::Keypoint;
use crate::klt::{LkParams, LkTracker};
use crate::pyramid::{Pyramid, PyramidBuilder, PyramidRatio};

/// Descriptor bytes carried per keypoint. The frame pipeline tracks
/// positions only.
const DESCRIPTOR_SIZE: usize = 0;

/// Frontend configuration.
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Upper bound on keypoints kept per frame.
    pub max_keypoints: usize,
    /// Detection runs when fewer than this many keypoints survive tracking.
    pub min_keypoints: usize,
    /// New detections closer than this (pixels) to a kept keypoint are
    /// ignored.
    pub min_distance: f32,
    /// Harris quality, relative to the strongest corner of the frame.
    pub harris_quality: f32,
    /// Harris octave depth. 1 is single scale.
    pub detection_depth: usize,
    /// Compute orientations for new detections (needs depth > 1 to be
    /// decoded, since rotation is only kept with a lod).
    pub orientation: bool,
    /// Levels of the tracking pyramid.
    pub pyramid_levels: usize,
    pub lk: LkParams,
    /// How detector output is read back. Tracking always reads back
    /// blocking, since its result is needed in the same frame.
    /// `AsyncBuffered` is read as `Async`: a buffered result belongs to an
    /// earlier frame and must not be accepted into this one.
    pub detection_transfer: Transfer,
    /// Encoder capacity relative to the expected number of candidates.
    pub encoder_headroom: f32,
    pub codec: CodecConfig,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        FrontendConfig {
            max_keypoints: 200,
            min_keypoints: 100,
            min_distance: 8.0,
            harris_quality: 0.1,
            detection_depth: 1,
            orientation: false,
            pyramid_levels: 3,
            lk: LkParams::default(),
            detection_transfer: Transfer::Blocking,
            encoder_headroom: 1.5,
            codec: CodecConfig::default(),
        }
    }
}

/// Wall-clock time spent in each stage of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTimings {
    pub pyramid: Duration,
    pub tracking: Duration,
    pub detection: Duration,
    pub upload: Duration,
    pub total: Duration,
}

/// Statistics returned after processing each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    /// Keypoints carried over from the previous frame.
    pub tracked: usize,
    /// Keypoints lost during tracking.
    pub lost: usize,
    /// New keypoints added by detection.
    pub detected: usize,
    /// Keypoints after this frame.
    pub total: usize,
    pub timings: FrameTimings,
}

pub struct Frontend {
    config: FrontendConfig,
    codec: KeypointCodec,
    harris: HarrisDetector,
    tracker: LkTracker,
    pyramids: PyramidBuilder,
    arena: TextureArena,
    keypoints: Vec<Keypoint>,
    /// Encoded copy of `keypoints`, input of the next tracking step.
    previous: Option<EncodedKeypoints>,
    frame_size: Option<(usize, usize)>,
    frames: u64,
}

impl Default for Frontend {
    fn default() -> Self {
        Self::new(FrontendConfig::default())
    }
}

impl Frontend {
    pub fn new(mut config: FrontendConfig) -> Self {
        if config.detection_transfer == Transfer::AsyncBuffered {
            warn!("buffered detection readback lags a frame behind, using Async instead");
            config.detection_transfer = Transfer::Async;
        }
        Frontend {
            codec: KeypointCodec::new(config.codec.clone()),
            config,
            harris: HarrisDetector::new(),
            tracker: LkTracker::new(),
            pyramids: PyramidBuilder::new(),
            arena: TextureArena::new(),
            keypoints: Vec::new(),
            previous: None,
            frame_size: None,
            frames: 0,
        }
    }

    pub fn config(&self) -> &FrontendConfig {
        &self.config
    }

    pub fn codec(&self) -> &KeypointCodec {
        &self.codec
    }

    /// Keypoints of the last processed frame.
    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Process one greyscale frame.
    ///
    /// A frame of a different size than the previous one starts over: the
    /// previous keypoints are dropped and detection runs from scratch.
    pub fn process(
        &mut self,
        backend: &mut dyn ComputeBackend,
        frame: &Image<u8>,
    ) -> Result<(&[Keypoint], FrameStats)> {
        let start = Instant::now();
        let mut stats = FrameStats::default();
        let size = (frame.width(), frame.height());
        if self.frame_size.is_some_and(|s| s != size) {
            debug!("frame size changed to {}×{}, starting over", size.0, size.1);
            self.reset(backend)?;
        }
        self.frame_size = Some(size);

        // Step 1: upload and pyramid.
        let t = Instant::now();
        let texture = upload_grey(backend, frame)?;
        self.arena.insert(backend, Purpose::Frame, 0, texture)?;
        let pyramid = self.pyramids.build(
            backend,
            texture,
            PyramidRatio::Two,
            self.config.pyramid_levels,
        )?;
        for (i, &level) in pyramid.levels().iter().enumerate() {
            self.arena.insert(backend, Purpose::Pyramid, i, level)?;
        }
        stats.timings.pyramid = t.elapsed();

        // Step 2: track.
        let t = Instant::now();
        let previous_pyramid = self.arena.all(Purpose::PreviousPyramid);
        let mut kept = Vec::with_capacity(self.config.max_keypoints);
        if let (Some(encoded), false) = (self.previous, previous_pyramid.is_empty()) {
            let prev = Pyramid::from_levels(previous_pyramid).with_ratio(PyramidRatio::Two);
            let tracked = self
                .tracker
                .track(backend, &pyramid, &prev, &encoded, &self.config.lk)?;
            let pixels = self.codec.download(backend, &tracked, Transfer::Blocking)?;
            let mut report = DecodeReport::with_extent(size.0 as f32, size.1 as f32);
            let decoded = self
                .codec
                .decode(&pixels, tracked.descriptor_size, Some(&mut report));
            for (keypoint, discard) in decoded.into_iter().zip(report.discard) {
                if !discard {
                    kept.push(keypoint);
                }
            }
            stats.tracked = kept.len();
            stats.lost = report.discard_count;
        }
        stats.timings.tracking = t.elapsed();

        // Step 3: replenish.
        let t = Instant::now();
        if kept.len() < self.config.min_keypoints {
            let found = self.detect(backend, pyramid.level(0), size, &mut kept)?;
            stats.detected = kept.len() - stats.tracked;

            // Step 4: the next detection should fit at least as many
            // candidates as this one produced.
            let expected = found.max(self.config.max_keypoints) as f32 * self.config.encoder_headroom;
            self.codec.optimize(expected.ceil() as usize, DESCRIPTOR_SIZE);
        }
        stats.timings.detection = t.elapsed();

        // Step 5: hand over to the next frame.
        let t = Instant::now();
        self.previous = if kept.is_empty() {
            None
        } else {
            Some(self.codec.upload(backend, &kept, DESCRIPTOR_SIZE)?)
        };
        self.arena.retain_all(Purpose::Pyramid);
        self.arena.end_frame(backend)?;
        self.arena
            .promote(backend, Purpose::Pyramid, Purpose::PreviousPyramid)?;
        stats.timings.upload = t.elapsed();

        self.keypoints = kept;
        self.frames += 1;
        stats.total = self.keypoints.len();
        stats.timings.total = start.elapsed();
        debug!(
            "frame {}: {} tracked, {} lost, {} detected, {} total",
            self.frames, stats.tracked, stats.lost, stats.detected, stats.total
        );
        Ok((&self.keypoints, stats))
    }

    /// Run the detector on `image` and append new keypoints to `kept`.
    /// Returns the number of candidates decoded.
    fn detect(
        &mut self,
        backend: &mut dyn ComputeBackend,
        image: Texture,
        size: (usize, usize),
        kept: &mut Vec<Keypoint>,
    ) -> Result<usize> {
        let depth = self.config.detection_depth;
        let mut encoded = self.harris.detect(
            backend,
            &mut self.codec,
            image,
            self.config.harris_quality,
            depth,
        )?;
        if self.config.orientation {
            encoded = self.harris.describe(backend, image, &encoded, depth)?;
        }
        let pixels = self
            .codec
            .download(backend, &encoded, self.config.detection_transfer)?;
        let mut report = DecodeReport::with_extent(size.0 as f32, size.1 as f32);
        let mut candidates: Vec<Keypoint> = self
            .codec
            .decode(&pixels, encoded.descriptor_size, Some(&mut report))
            .into_iter()
            .zip(report.discard)
            .filter_map(|(k, discard)| (!discard).then_some(k))
            .collect();
        let found = candidates.len();

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        let min_sq = self.config.min_distance * self.config.min_distance;
        for candidate in candidates {
            if kept.len() >= self.config.max_keypoints {
                break;
            }
            if kept.iter().all(|k| k.distance_sq(&candidate) >= min_sq) {
                kept.push(candidate);
            }
        }
        Ok(found)
    }

    /// Forget all keypoints and release every texture held across frames.
    pub fn reset(&mut self, backend: &mut dyn ComputeBackend) -> Result<()> {
        self.arena.clear(backend)?;
        self.keypoints.clear();
        self.previous = None;
        self.frame_size = None;
        self.codec.cancel_buffered();
        Ok(())
    }
}
