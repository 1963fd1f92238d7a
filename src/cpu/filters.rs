// cpu/filters.rs — Image-to-image kernels: convolution, resampling,
// colour conversion, identity and max reduction.
//
// Borders are mirrored (reflect-101) for convolutions. Mirroring keeps the
// zero-stuffed phase of an upsampled image intact at the edges, so the
// 2× and 3× interpolation filters keep unit gain up to the last pixel.

use crate::error::Result;
use crate::image::{Image, Rgba};

use super::KernelContext;

// ---------------------------------------------------------------------------
// Separable convolution
// ---------------------------------------------------------------------------

fn taps<'a>(ctx: &'a KernelContext<'_>) -> Result<&'a [f32]> {
    let w = &ctx.spec.weights;
    if w.is_empty() || w.len() % 2 == 0 {
        return Err(ctx.invalid(format!(
            "convolution needs an odd number of weights, got {}",
            w.len()
        )));
    }
    Ok(w)
}

/// Convolve r, g, b with `weights` along the direction given by `step`.
/// Alpha is copied from the centre texel.
fn convolve(
    src: &Image<Rgba>,
    weights: &[f32],
    width: usize,
    height: usize,
    step: (isize, isize),
) -> Image<Rgba> {
    let r = (weights.len() / 2) as isize;
    Image::from_fn(width, height, |x, y| {
        let (x, y) = (x as isize, y as isize);
        let mut acc = [0.0f32; 3];
        for (i, &w) in weights.iter().enumerate() {
            let k = i as isize - r;
            let p = src.get_reflected(x + k * step.0, y + k * step.1);
            acc[0] += w * p.0[0];
            acc[1] += w * p.0[1];
            acc[2] += w * p.0[2];
        }
        let alpha = src.get_reflected(x, y).a();
        Rgba([acc[0], acc[1], acc[2], alpha])
    })
}

pub(crate) fn convolution_x(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let src = ctx.image(0)?;
    Ok(convolve(src, taps(ctx)?, ctx.width, ctx.height, (1, 0)))
}

pub(crate) fn convolution_y(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let src = ctx.image(0)?;
    Ok(convolve(src, taps(ctx)?, ctx.width, ctx.height, (0, 1)))
}

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// Zero-stuffing upsample: source texels land on multiples of `factor`,
/// everything in between is black. The interpolation filter that follows
/// fills the gaps.
pub(crate) fn upsample(ctx: &KernelContext<'_>, factor: usize) -> Result<Image<Rgba>> {
    let src = ctx.image(0)?;
    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        if x % factor == 0 && y % factor == 0 {
            let p = src.get_clamped((x / factor) as isize, (y / factor) as isize);
            Rgba([p.0[0], p.0[1], p.0[2], 1.0])
        } else {
            Rgba([0.0, 0.0, 0.0, 1.0])
        }
    }))
}

/// Keep every `factor`-th texel in each direction.
pub(crate) fn downsample(ctx: &KernelContext<'_>, factor: usize) -> Result<Image<Rgba>> {
    let src = ctx.image(0)?;
    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        src.get_clamped((x * factor) as isize, (y * factor) as isize)
    }))
}

// ---------------------------------------------------------------------------
// Colour
// ---------------------------------------------------------------------------

/// BT.601 luma into all three colour channels.
pub(crate) fn rgb2grey(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let src = ctx.image(0)?;
    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        let p = src.get_clamped(x as isize, y as isize);
        let l = 0.299 * p.r() + 0.587 * p.g() + 0.114 * p.b();
        Rgba([l, l, l, p.a()])
    }))
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

/// Copy the input into the output size, cropping or padding with zeros.
pub(crate) fn identity(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let src = ctx.image(0)?;
    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        src.try_get(x as isize, y as isize).unwrap_or(Rgba::ZERO)
    }))
}

/// One step of a parallel max reduction over the red channel:
/// `out(x, y).r = max(in(x, y), in(x+s, y), in(x, y+s), in(x+s, y+s))`.
/// After passes with s = 1, 2, 4, … ≥ max(w, h), texel (0, 0) holds the
/// global maximum.
pub(crate) fn scan_max(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let src = ctx.image(0)?;
    let step = ctx.int(1)?;
    if step < 1 {
        return Err(ctx.invalid(format!("step must be positive, got {step}")));
    }
    let s = step as isize;
    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        let (x, y) = (x as isize, y as isize);
        let mut p = src.get_clamped(x, y);
        for (dx, dy) in [(s, 0), (0, s), (s, s)] {
            if let Some(q) = src.try_get(x + dx, y + dy) {
                p.0[0] = p.0[0].max(q.r());
            }
        }
        p
    }))
}

#[cfg(test)]
mod tests {
    use crate::backend::{ComputeBackend, KernelArg, KernelSettings, KernelSpec, Texture};
    use crate::cpu::CpuBackend;
    use crate::image::{Image, Rgba};

    fn run(
        cpu: &mut CpuBackend,
        spec: KernelSpec,
        settings: KernelSettings,
        args: &[KernelArg<'_>],
    ) -> Image<Rgba> {
        let k = cpu.create_kernel("test", &spec, &settings).unwrap();
        let out = cpu.invoke(k, args).unwrap();
        cpu.texels(out).unwrap().clone()
    }

    fn upload(cpu: &mut CpuBackend, img: &Image<f32>) -> Texture {
        let texels = img.map(Rgba::grey);
        cpu.upload(img.width() as u32, img.height() as u32, texels.as_slice())
            .unwrap()
    }

    #[test]
    fn test_smoothing_preserves_constant() {
        let mut cpu = CpuBackend::new();
        let t = upload(&mut cpu, &Image::filled(7, 5, 0.6));
        let spec = KernelSpec::new("filters/convolution-x")
            .with_arguments(&["image"])
            .with_weights(&[0.05, 0.25, 0.4, 0.25, 0.05]);
        let out = run(&mut cpu, spec, KernelSettings::default(), &[KernelArg::Texture(t)]);
        for (_, _, p) in out.pixels() {
            assert!((p.r() - 0.6).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_stuffed_upsample_keeps_unit_gain() {
        // upsample2 followed by the 2× interpolation filter reproduces a
        // constant image everywhere, borders included.
        let mut cpu = CpuBackend::new();
        let t = upload(&mut cpu, &Image::filled(4, 3, 0.5));
        let up = cpu
            .create_kernel(
                "up",
                &KernelSpec::new("pyramids/upsample2").with_arguments(&["image"]),
                &KernelSettings::scaled(2, 1),
            )
            .unwrap();
        let sx = cpu
            .create_kernel(
                "sx",
                &KernelSpec::new("filters/convolution-x")
                    .with_arguments(&["image"])
                    .with_weights(&[0.1, 0.5, 0.8, 0.5, 0.1]),
                &KernelSettings::default(),
            )
            .unwrap();
        let sy = cpu
            .create_kernel(
                "sy",
                &KernelSpec::new("filters/convolution-y")
                    .with_arguments(&["image"])
                    .with_weights(&[0.1, 0.5, 0.8, 0.5, 0.1]),
                &KernelSettings::default(),
            )
            .unwrap();
        let a = cpu.invoke(up, &[KernelArg::Texture(t)]).unwrap();
        assert_eq!(a.size(), (8, 6));
        let b = cpu.invoke(sx, &[KernelArg::Texture(a)]).unwrap();
        let c = cpu.invoke(sy, &[KernelArg::Texture(b)]).unwrap();
        for (x, y, p) in cpu.texels(c).unwrap().pixels() {
            assert!((p.r() - 0.5).abs() < 1e-5, "({x},{y}) = {}", p.r());
        }
    }

    #[test]
    fn test_downsample3_size_and_samples() {
        let mut cpu = CpuBackend::new();
        let img = Image::from_fn(7, 4, |x, y| (x + 10 * y) as f32 / 100.0);
        let t = upload(&mut cpu, &img);
        let spec = KernelSpec::new("pyramids/downsample3").with_arguments(&["image"]);
        let out = run(&mut cpu, spec, KernelSettings::scaled(1, 3), &[KernelArg::Texture(t)]);
        assert_eq!((out.width(), out.height()), (3, 2));
        assert!((out.get(2, 1).r() - img.get(6, 3)).abs() < 1e-6);
    }

    #[test]
    fn test_rgb2grey_weights() {
        let mut cpu = CpuBackend::new();
        let t = cpu.upload(1, 1, &[Rgba::new(1.0, 0.0, 0.0, 1.0)]).unwrap();
        let spec = KernelSpec::new("colors/rgb2grey").with_arguments(&["image"]);
        let out = run(&mut cpu, spec, KernelSettings::default(), &[KernelArg::Texture(t)]);
        assert!((out.get(0, 0).r() - 0.299).abs() < 1e-6);
        assert!((out.get(0, 0).b() - 0.299).abs() < 1e-6);
    }

    #[test]
    fn test_scan_max_finds_global_maximum() {
        let mut cpu = CpuBackend::new();
        let mut img = Image::filled(13, 9, 0.1f32);
        img.set(11, 7, 0.9);
        img.set(3, 2, 0.5);
        let t = upload(&mut cpu, &img);
        let k = cpu
            .create_kernel(
                "scanMax",
                &KernelSpec::new("utils/scan-max").with_arguments(&["image", "step"]),
                &KernelSettings::default().uses_pingpong_rendering(),
            )
            .unwrap();
        let mut cur = t;
        let mut step = 1;
        while step < 13 {
            cur = cpu.invoke(k, &[KernelArg::Texture(cur), KernelArg::Int(step)]).unwrap();
            step *= 2;
        }
        assert!((cpu.texels(cur).unwrap().get(0, 0).r() - 0.9).abs() < 1e-6);
    }
}
