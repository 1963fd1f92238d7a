// tests/test_frontend.rs — Integration tests for the frame-by-frame
// detect/track pipeline.

use rudolf_kt::codec::Transfer;
use rudolf_kt::cpu::CpuBackend;
use rudolf_kt::error::Error;
use rudolf_kt::frontend::{Frontend, FrontendConfig};
use rudolf_kt::image::Image;
use rudolf_kt::klt::LkParams;

/// Create a multi-rectangle scene with controllable shift.
fn make_scene(shift_x: usize, shift_y: usize) -> Image<u8> {
    let (w, h) = (160, 120);
    let mut img = Image::from_vec(w, h, vec![25u8; w * h]);
    let rects: [(usize, usize, usize, usize, u8); 6] = [
        (30, 25, 20, 20, 200),
        (70, 20, 25, 15, 180),
        (110, 30, 18, 22, 210),
        (25, 65, 22, 25, 190),
        (75, 60, 30, 20, 170),
        (115, 70, 20, 18, 205),
    ];
    for &(rx, ry, rw, rh, val) in &rects {
        let (rx, ry) = (rx + shift_x, ry + shift_y);
        for y in ry..(ry + rh).min(h) {
            for x in rx..(rx + rw).min(w) {
                img.set(x, y, val);
            }
        }
    }
    img
}

fn config() -> FrontendConfig {
    FrontendConfig {
        max_keypoints: 40,
        min_keypoints: 10,
        ..Default::default()
    }
}

// ===== Multi-frame pipeline tests =====

#[test]
fn five_frame_sequence() {
    env_logger::builder().is_test(true).try_init().ok();
    let mut cpu = CpuBackend::new();
    let mut frontend = Frontend::new(config());

    for i in 0..5 {
        let (keypoints, stats) = frontend.process(&mut cpu, &make_scene(i, 0)).unwrap();
        assert!(!keypoints.is_empty(), "frame {i} has no keypoints");
        assert!(keypoints.len() <= 40);
        assert_eq!(stats.total, keypoints.len());
        assert_eq!(stats.total, stats.tracked + stats.detected);
        if i > 0 {
            assert!(stats.tracked > 0, "frame {i} tracked nothing");
        }
    }
    assert_eq!(frontend.frames_processed(), 5);
    // Only the tracking pyramid outlives a frame.
    assert_eq!(cpu.live_textures(), frontend.config().pyramid_levels);
}

#[test]
fn tracked_keypoints_follow_the_motion() {
    let mut cpu = CpuBackend::new();
    let config = FrontendConfig {
        // Replenish only when nothing survives, so every keypoint of frame
        // 2 is a tracked one.
        min_keypoints: 1,
        ..config()
    };
    let mut frontend = Frontend::new(config);

    let (first, _) = frontend.process(&mut cpu, &make_scene(0, 0)).unwrap();
    let first = first.to_vec();
    let (second, stats) = frontend.process(&mut cpu, &make_scene(2, 1)).unwrap();
    assert_eq!(stats.detected, 0);
    assert!(!second.is_empty());

    // Each tracked keypoint sits about (2, 1) away from some keypoint of the
    // first frame.
    for kp in second {
        let nearest = first
            .iter()
            .map(|f| ((kp.x - f.x - 2.0).powi(2) + (kp.y - f.y - 1.0).powi(2)).sqrt())
            .fold(f32::INFINITY, f32::min);
        assert!(nearest < 0.75, "({}, {}) off by {nearest}", kp.x, kp.y);
    }
}

#[test]
fn lost_keypoints_are_replenished() {
    let mut cpu = CpuBackend::new();
    let mut frontend = Frontend::new(config());
    frontend.process(&mut cpu, &make_scene(0, 0)).unwrap();

    // A blank frame loses everything; the next textured frame detects anew.
    let blank = Image::from_vec(160, 120, vec![25u8; 160 * 120]);
    let (keypoints, stats) = frontend.process(&mut cpu, &blank).unwrap();
    assert!(keypoints.is_empty());
    assert_eq!(stats.tracked, 0);
    assert!(stats.lost > 0);

    let (keypoints, stats) = frontend.process(&mut cpu, &make_scene(0, 0)).unwrap();
    assert_eq!(stats.tracked, 0);
    assert!(stats.detected > 0);
    assert_eq!(keypoints.len(), stats.detected);
}

// ===== Configuration variants =====

#[test]
fn buffered_detection_never_reuses_an_earlier_frame() {
    let mut cpu = CpuBackend::new();
    let config = FrontendConfig {
        detection_transfer: Transfer::AsyncBuffered,
        ..config()
    };
    let mut frontend = Frontend::new(config);
    assert_eq!(frontend.config().detection_transfer, Transfer::Async);
    let (keypoints, _) = frontend.process(&mut cpu, &make_scene(0, 0)).unwrap();
    assert!(!keypoints.is_empty());

    // Nothing from the textured frame may show up as a detection on a blank
    // one.
    let blank = Image::from_vec(160, 120, vec![25u8; 160 * 120]);
    let (keypoints, stats) = frontend.process(&mut cpu, &blank).unwrap();
    assert_eq!(stats.tracked, 0);
    assert_eq!(stats.detected, 0);
    assert!(keypoints.is_empty());

    // Back on texture, detections come from the current frame.
    let (keypoints, stats) = frontend.process(&mut cpu, &make_scene(3, 2)).unwrap();
    assert!(stats.detected > 0);
    assert_eq!(keypoints.len(), stats.detected);
}

#[test]
fn multiscale_detection_with_orientation() {
    let mut cpu = CpuBackend::new();
    let config = FrontendConfig {
        detection_depth: 2,
        orientation: true,
        lk: LkParams {
            window_size: 9,
            ..LkParams::default()
        },
        ..config()
    };
    let mut frontend = Frontend::new(config);
    let (keypoints, _) = frontend.process(&mut cpu, &make_scene(0, 0)).unwrap();
    assert!(!keypoints.is_empty());
    assert!(keypoints.iter().all(|k| k.lod.is_some()));
    let (_, stats) = frontend.process(&mut cpu, &make_scene(1, 1)).unwrap();
    assert!(stats.tracked > 0);
}

#[test]
fn encoder_is_sized_after_detection() {
    let mut cpu = CpuBackend::new();
    let mut frontend = Frontend::new(config());
    frontend.process(&mut cpu, &make_scene(0, 0)).unwrap();
    // Room for at least max_keypoints × headroom.
    assert!(frontend.codec().capacity(0) >= 60);
}

// ===== Failure handling =====

#[test]
fn readback_failure_is_transient() {
    let mut cpu = CpuBackend::new();
    let mut frontend = Frontend::new(config());
    let (first, _) = frontend.process(&mut cpu, &make_scene(0, 0)).unwrap();
    let carried = first.len();

    cpu.fail_next_readback();
    let err = frontend.process(&mut cpu, &make_scene(1, 0)).unwrap_err();
    assert!(matches!(err, Error::Download(_)), "{err}");
    assert!(err.is_transient());

    // The failed frame left the previous state alone: retrying tracks it.
    let (_, stats) = frontend.process(&mut cpu, &make_scene(1, 0)).unwrap();
    assert_eq!(stats.tracked + stats.lost, carried);
    assert!(stats.tracked > 0);
    assert_eq!(cpu.live_textures(), frontend.config().pyramid_levels);
}
