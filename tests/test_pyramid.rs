// tests/test_pyramid.rs — Integration tests for pyramid construction and
// resampling on the CPU backend.

use rudolf_kt::backend::{ComputeBackend, Texture};
use rudolf_kt::cpu::CpuBackend;
use rudolf_kt::image::{Image, Rgba};
use rudolf_kt::keypoint::PYRAMID_MAX_LEVELS;
use rudolf_kt::pyramid::{PyramidBuilder, PyramidRatio};

fn upload_fn(
    cpu: &mut CpuBackend,
    w: usize,
    h: usize,
    f: impl FnMut(usize, usize) -> f32,
) -> Texture {
    let mut f = f;
    let img = Image::from_fn(w, h, |x, y| Rgba::grey(f(x, y)));
    cpu.upload(w as u32, h as u32, img.as_slice()).unwrap()
}

fn sizes(levels: &[Texture]) -> Vec<(u32, u32)> {
    levels.iter().map(|t| t.size()).collect()
}

// ===== Level geometry =====

#[test]
fn odd_sizes_round_up() {
    let mut cpu = CpuBackend::new();
    let mut builder = PyramidBuilder::new();
    let img = upload_fn(&mut cpu, 65, 49, |_, _| 0.5);
    let pyr = builder.build(&mut cpu, img, PyramidRatio::Two, 3).unwrap();
    assert_eq!(sizes(pyr.levels()), vec![(65, 49), (33, 25), (17, 13)]);
}

#[test]
fn level_count_is_clamped() {
    let mut cpu = CpuBackend::new();
    let mut builder = PyramidBuilder::new();
    let img = upload_fn(&mut cpu, 64, 64, |_, _| 0.5);

    let pyr = builder.build(&mut cpu, img, PyramidRatio::Two, 12).unwrap();
    assert_eq!(pyr.len(), PYRAMID_MAX_LEVELS);
    pyr.release(&mut cpu).unwrap();

    let pyr = builder.build(&mut cpu, img, PyramidRatio::Two, 0).unwrap();
    assert_eq!(pyr.len(), 1);
    assert_eq!(pyr.level(0).size(), (64, 64));
}

#[test]
fn one_and_a_half_ratio() {
    let mut cpu = CpuBackend::new();
    let mut builder = PyramidBuilder::new();
    let img = upload_fn(&mut cpu, 90, 60, |_, _| 0.5);
    let pyr = builder.build(&mut cpu, img, PyramidRatio::OneAndHalf, 3).unwrap();
    assert_eq!(sizes(pyr.levels()), vec![(90, 60), (60, 40), (40, 27)]);
}

#[test]
fn half_octave_stack_interleaves() {
    let mut cpu = CpuBackend::new();
    let mut builder = PyramidBuilder::new();
    let img = upload_fn(&mut cpu, 64, 64, |_, _| 0.5);
    let octaves = builder.build_octaves(&mut cpu, img, 3).unwrap();
    // lods 0, 0.5, 1, 1.5, 2
    assert_eq!(
        sizes(octaves.levels()),
        vec![(64, 64), (43, 43), (32, 32), (22, 22), (16, 16)]
    );
}

#[test]
fn padded_repeats_the_coarsest_level() {
    let mut cpu = CpuBackend::new();
    let mut builder = PyramidBuilder::new();
    let img = upload_fn(&mut cpu, 32, 32, |_, _| 0.5);
    let pyr = builder.build(&mut cpu, img, PyramidRatio::Two, 2).unwrap();
    let padded = pyr.padded(PYRAMID_MAX_LEVELS);
    assert_eq!(padded.len(), PYRAMID_MAX_LEVELS);
    assert_eq!(padded[1], pyr.level(1));
    assert_eq!(padded[4], pyr.level(1));
}

// ===== Resampling =====

#[test]
fn constant_image_survives_reduce_and_expand() {
    let mut cpu = CpuBackend::new();
    let mut builder = PyramidBuilder::new();
    let img = upload_fn(&mut cpu, 40, 30, |_, _| 0.6);

    let reduced = builder.reduce(&mut cpu, img).unwrap();
    let expanded = builder.expand(&mut cpu, reduced).unwrap();
    assert_eq!(expanded.size(), (40, 30));
    for tex in [reduced, expanded] {
        for (x, y, p) in cpu.texels(tex).unwrap().pixels() {
            assert!((p.r() - 0.6).abs() < 1e-4, "({x}, {y}) = {}", p.r());
        }
    }
}

#[test]
fn intra_scales_are_inverse_in_size() {
    let mut cpu = CpuBackend::new();
    let mut builder = PyramidBuilder::new();
    let img = upload_fn(&mut cpu, 60, 45, |_, _| 0.4);

    let small = builder.intra_reduce(&mut cpu, img).unwrap();
    assert_eq!(small.size(), (40, 30));
    let back = builder.intra_expand(&mut cpu, small).unwrap();
    assert_eq!(back.size(), (60, 45));

    // The 3× interpolation loses its outer sample on the last row and
    // column; everything else keeps unit gain.
    let texels = cpu.texels(back).unwrap();
    for y in 2..43 {
        for x in 2..58 {
            assert!((texels.get(x, y).r() - 0.4).abs() < 1e-3, "({x}, {y})");
        }
    }
}

#[test]
fn reduce_then_expand_approximates_a_smooth_image() {
    let mut cpu = CpuBackend::new();
    let mut builder = PyramidBuilder::new();
    let img = upload_fn(&mut cpu, 64, 64, |x, _| x as f32 / 63.0);
    let reduced = builder.reduce(&mut cpu, img).unwrap();
    let expanded = builder.expand(&mut cpu, reduced).unwrap();

    let original = cpu.texels(img).unwrap().clone();
    let restored = cpu.texels(expanded).unwrap();
    for y in 4..60 {
        for x in 4..60 {
            let err = (original.get(x, y).r() - restored.get(x, y).r()).abs();
            assert!(err < 0.02, "({x}, {y}) off by {err}");
        }
    }
}

// ===== Ownership =====

#[test]
fn release_frees_every_level() {
    let mut cpu = CpuBackend::new();
    let mut builder = PyramidBuilder::new();
    let img = upload_fn(&mut cpu, 64, 48, |x, y| ((x + y) % 7) as f32 / 7.0);
    assert_eq!(cpu.live_textures(), 1);

    let pyr = builder.build(&mut cpu, img, PyramidRatio::Two, 4).unwrap();
    assert_eq!(cpu.live_textures(), 5);
    pyr.release(&mut cpu).unwrap();
    assert_eq!(cpu.live_textures(), 1);
}
