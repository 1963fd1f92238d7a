// tests/test_harris.rs — Integration tests for the multiscale Harris
// detector and its encoded output.

use rudolf_kt::backend::{upload_grey, ComputeBackend};
use rudolf_kt::codec::{CodecConfig, KeypointCodec, Transfer};
use rudolf_kt::cpu::CpuBackend;
use rudolf_kt::harris::HarrisDetector;
use rudolf_kt::image::Image;
use rudolf_kt::keypoint::Keypoint;

fn make_chessboard(img_size: usize, cell_size: usize, lo: u8, hi: u8) -> Image<u8> {
    Image::from_fn(img_size, img_size, |x, y| {
        if (x / cell_size + y / cell_size) % 2 == 0 {
            lo
        } else {
            hi
        }
    })
}

/// Detect on `img` and decode everything the encoder produced.
fn detect(img: &Image<u8>, quality: f32, depth: usize) -> Vec<Keypoint> {
    let mut cpu = CpuBackend::new();
    let mut codec = KeypointCodec::new(CodecConfig::default());
    codec.optimize(500, 0);
    let mut harris = HarrisDetector::new();
    let tex = upload_grey(&mut cpu, img).unwrap();
    let encoded = harris.detect(&mut cpu, &mut codec, tex, quality, depth).unwrap();
    let pixels = codec.download(&mut cpu, &encoded, Transfer::Blocking).unwrap();
    codec.decode(&pixels, 0, None)
}

// ===== Chessboard =====

#[test]
fn harris_detects_chessboard_junctions() {
    env_logger::builder().is_test(true).try_init().ok();
    let img = make_chessboard(100, 10, 20, 230);
    let keypoints = detect(&img, 0.1, 1);
    assert!(
        keypoints.len() >= 20,
        "expected many corners at chessboard junctions, got {}",
        keypoints.len()
    );
}

#[test]
fn harris_corners_at_cell_boundaries() {
    let cell = 10;
    let img = make_chessboard(100, cell, 20, 230);
    for kp in detect(&img, 0.1, 1) {
        let off = |v: f32| {
            let r = v.rem_euclid(cell as f32);
            r.min(cell as f32 - r)
        };
        assert!(
            off(kp.x) <= 2.0 && off(kp.y) <= 2.0,
            "corner at ({}, {}) is not near a junction",
            kp.x,
            kp.y
        );
    }
}

#[test]
fn single_scale_has_no_lod_and_normalised_scores() {
    let img = make_chessboard(60, 10, 20, 230);
    let keypoints = detect(&img, 0.1, 1);
    assert!(!keypoints.is_empty());
    assert!(keypoints.iter().all(|k| k.lod.is_none()));
    assert!(keypoints.iter().all(|k| k.score > 0.0 && k.score <= 1.0));
    // The strongest corner defines the scale.
    let best = keypoints.iter().map(|k| k.score).fold(0.0f32, f32::max);
    assert!(best > 0.99, "best score {best}");
}

// ===== Quality and scale =====

#[test]
fn higher_quality_keeps_fewer_corners() {
    // Uneven contrast gives corners of different strength.
    let img = Image::from_fn(80, 80, |x, y| {
        let cell = (x / 16 + y / 16) % 2 == 0;
        let contrast = 40 + (x / 16) as u8 * 40;
        if cell {
            30
        } else {
            30 + contrast
        }
    });
    let loose = detect(&img, 0.05, 1);
    let strict = detect(&img, 0.8, 1);
    assert!(!strict.is_empty());
    assert!(strict.len() < loose.len(), "{} vs {}", strict.len(), loose.len());
}

#[test]
fn multiscale_records_half_octave_lods() {
    let img = make_chessboard(96, 12, 20, 230);
    let keypoints = detect(&img, 0.1, 3);
    assert!(!keypoints.is_empty());
    for kp in &keypoints {
        let lod = kp.lod.expect("multiscale keypoints carry a lod");
        assert!((0.0..=2.05).contains(&lod), "lod {lod}");
        let half_steps = lod * 2.0;
        assert!((half_steps - half_steps.round()).abs() < 0.05, "lod {lod}");
    }
}

#[test]
fn flat_image_has_no_corners() {
    let img = Image::from_vec(48, 48, vec![128u8; 48 * 48]);
    assert!(detect(&img, 0.1, 2).is_empty());
}

// ===== Orientation =====

#[test]
fn describe_fills_rotations() {
    let mut cpu = CpuBackend::new();
    let mut codec = KeypointCodec::new(CodecConfig::default());
    codec.optimize(500, 0);
    let mut harris = HarrisDetector::new();
    // A bright wedge: corners whose intensity centroid is off-centre.
    let img = Image::from_fn(64, 64, |x, y| if x > 20 && y > 20 && x + y < 100 { 220 } else { 20 });
    let tex = upload_grey(&mut cpu, &img).unwrap();

    let encoded = harris.detect(&mut cpu, &mut codec, tex, 0.1, 2).unwrap();
    let described = harris.describe(&mut cpu, tex, &encoded, 2).unwrap();
    assert_eq!(described.encoder_length, encoded.encoder_length);

    let pixels = codec.download(&mut cpu, &described, Transfer::Blocking).unwrap();
    let keypoints = codec.decode(&pixels, 0, None);
    assert!(!keypoints.is_empty());
    assert!(keypoints
        .iter()
        .all(|k| k.rotation.abs() <= std::f32::consts::PI + 1e-4));
    assert!(keypoints.iter().any(|k| k.rotation != decode_zero_rotation()));
    cpu.release(tex).unwrap();
}

/// What an unrotated record decodes to after byte quantisation.
fn decode_zero_rotation() -> f32 {
    rudolf_kt::keypoint::decode_rotation(rudolf_kt::keypoint::encode_rotation(0.0))
}
