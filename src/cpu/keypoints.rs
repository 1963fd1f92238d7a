// cpu/keypoints.rs — Corner detection kernels.
//
// Corner map texel layout shared by everything in this file:
//
//   r  score (0 = not a corner)
//   g  lod code / 255 (255 = single scale)
//   b  scratch (the offset encoder writes here)
//   a  unused
//
// The Harris response is the minimum eigenvalue of the windowed structure
// tensor (Shi-Tomasi form). It is computed for each base pixel at every
// half-octave, and the strongest octave wins.

use crate::error::Result;
use crate::image::{interpolate_bilinear, Image, Rgba};
use crate::keypoint::{decode_lod, encode_lod, encode_rotation, pixels_per_keypoint, KeypointRecord, NO_LOD};

use super::encoders::{read_bytes, write_bytes};
use super::KernelContext;

/// Radius of the intensity-centroid patch.
pub const ORIENTATION_PATCH_RADIUS: isize = 7;

#[inline]
fn byte(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

// ---------------------------------------------------------------------------
// Sobel
// ---------------------------------------------------------------------------

/// 3×3 Sobel on the red channel: `[dx, dy, 0, 1]`, normalised by 1/8 so the
/// result is an intensity difference per pixel.
pub(crate) fn sobel(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let src = ctx.image(0)?;
    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        let (x, y) = (x as isize, y as isize);
        let p = |dx: isize, dy: isize| src.get_clamped(x + dx, y + dy).r();
        let dx = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
        let dy = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
        Rgba([dx / 8.0, dy / 8.0, 0.0, 1.0])
    }))
}

// ---------------------------------------------------------------------------
// Harris response
// ---------------------------------------------------------------------------

/// Minimum eigenvalue of the averaged structure tensor around (cx, cy).
fn min_eigenvalue(deriv: &Image<Rgba>, cx: isize, cy: isize, radius: isize) -> f32 {
    let (mut ixx, mut ixy, mut iyy) = (0.0f32, 0.0f32, 0.0f32);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let d = deriv.get_clamped(cx + dx, cy + dy);
            let (gx, gy) = (d.r(), d.g());
            ixx += gx * gx;
            ixy += gx * gy;
            iyy += gy * gy;
        }
    }
    let n = ((2 * radius + 1) * (2 * radius + 1)) as f32;
    let (a, b, c) = (ixx / n, ixy / n, iyy / n);
    let half_trace = 0.5 * (a + c);
    let disc = (0.25 * (a - c) * (a - c) + b * b).sqrt();
    (half_trace - disc).max(0.0)
}

/// Arguments: derivative textures (one per half-octave, padded), number of
/// octaves actually in use, window size (odd, 1..=7).
pub(crate) fn harris(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let derivs = ctx.images(0)?;
    let octaves = ctx.int_in(1, 1..=derivs.len() as i32)? as usize;
    let window = ctx.int_in(2, 1..=7)?;
    if window % 2 == 0 {
        return Err(ctx.invalid(format!("window size must be odd, got {window}")));
    }
    let radius = (window / 2) as isize;
    let base_w = derivs[0].width() as f32;
    let base_h = derivs[0].height() as f32;

    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        let mut best = 0.0f32;
        let mut best_octave = 0usize;
        for (j, d) in derivs.iter().take(octaves).enumerate() {
            let sx = d.width() as f32 / base_w;
            let sy = d.height() as f32 / base_h;
            let cx = ((x as f32 + 0.5) * sx - 0.5).round() as isize;
            let cy = ((y as f32 + 0.5) * sy - 0.5).round() as isize;
            let score = min_eigenvalue(d, cx, cy, radius);
            if score > best {
                best = score;
                best_octave = j;
            }
        }
        let code = if octaves == 1 {
            NO_LOD
        } else {
            encode_lod(Some(best_octave as f32 * 0.5))
        };
        Rgba([best, code as f32 / 255.0, 0.0, 0.0])
    }))
}

/// Keep corners with `score >= quality * max`, normalise kept scores to
/// [0, 1] by the maximum, zero everything else.
///
/// Arguments: corner map, max texture (value in texel (0, 0).r), quality.
pub(crate) fn harris_cutoff(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let corners = ctx.image(0)?;
    let max = ctx.image(1)?.get(0, 0).r();
    let quality = ctx.float(2)?.clamp(0.0, 1.0);
    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        let p = corners.get(x, y);
        let s = p.r();
        if max > 0.0 && s > 0.0 && s >= quality * max {
            Rgba([s / max, p.g(), 0.0, 0.0])
        } else {
            Rgba::ZERO
        }
    }))
}

// ---------------------------------------------------------------------------
// Non-maximum suppression
// ---------------------------------------------------------------------------

/// Does the candidate at `other` beat the one at `this`? Higher score wins;
/// equal scores go to the lower raster index.
#[inline]
fn beats(other_score: f32, other_index: usize, this_score: f32, this_index: usize) -> bool {
    other_score > this_score || (other_score == this_score && other_index < this_index)
}

/// 3×3 suppression among corners that share a lod code.
pub(crate) fn samescale_suppression(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let corners = ctx.image(0)?;
    let w = corners.width();
    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        let p = corners.get(x, y);
        if p.r() <= 0.0 {
            return Rgba::ZERO;
        }
        let code = byte(p.g());
        let index = y * w + x;
        for dy in -1isize..=1 {
            for dx in -1isize..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let (nx, ny) = (x as isize + dx, y as isize + dy);
                let Some(q) = corners.try_get(nx, ny) else {
                    continue;
                };
                if q.r() <= 0.0 || byte(q.g()) != code {
                    continue;
                }
                let n_index = ny as usize * w + nx as usize;
                if beats(q.r(), n_index, p.r(), index) {
                    return Rgba::ZERO;
                }
            }
        }
        p
    }))
}

/// Suppression against corners at adjacent half-octaves (|Δlod| = 0.5)
/// inside a window that grows with the coarser octave's footprint.
/// Single-scale corners pass through.
pub(crate) fn multiscale_suppression(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let corners = ctx.image(0)?;
    let w = corners.width();
    Ok(Image::from_fn(ctx.width, ctx.height, |x, y| {
        let p = corners.get(x, y);
        let Some(lod) = (p.r() > 0.0).then(|| decode_lod(byte(p.g()))).flatten() else {
            return p;
        };
        let index = y * w + x;
        let reach = 2f32.powf(lod + 1.0).ceil() as isize;
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let (nx, ny) = (x as isize + dx, y as isize + dy);
                let Some(q) = corners.try_get(nx, ny) else {
                    continue;
                };
                if q.r() <= 0.0 {
                    continue;
                }
                let Some(n_lod) = decode_lod(byte(q.g())) else {
                    continue;
                };
                let gap = (n_lod - lod).abs();
                if !(0.25..0.75).contains(&gap) {
                    continue;
                }
                let radius = 2f32.powf(lod.max(n_lod) + 0.5).ceil() as isize;
                if dx.abs() > radius || dy.abs() > radius {
                    continue;
                }
                let n_index = ny as usize * w + nx as usize;
                if beats(q.r(), n_index, p.r(), index) {
                    return Rgba::ZERO;
                }
            }
        }
        p
    }))
}

// ---------------------------------------------------------------------------
// Orientation
// ---------------------------------------------------------------------------

/// Intensity-centroid orientation, written into the rotation byte of each
/// encoded keypoint.
///
/// Arguments: encoded keypoints, octave textures (padded), descriptor size.
pub(crate) fn orientation_via_centroid(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let encoded = ctx.image(0)?;
    let octaves = ctx.images(1)?;
    let descriptor_size = ctx.int_in(2, 0..=crate::keypoint::MAX_DESCRIPTOR_SIZE as i32)? as usize;
    let stride = pixels_per_keypoint(descriptor_size) * 4;

    let mut bytes = read_bytes(encoded);
    let base_w = octaves[0].width() as f32;
    let r = ORIENTATION_PATCH_RADIUS;

    let mut offset = 0;
    while offset + stride <= bytes.len() {
        let mut rec = KeypointRecord::read(&bytes[offset..]);
        if rec.is_sentinel() {
            break;
        }
        if !rec.is_discarded() && !rec.is_noise() {
            let lod = decode_lod(rec.lod).unwrap_or(0.0);
            let j = ((lod * 2.0).round().max(0.0) as usize).min(octaves.len() - 1);
            let img = octaves[j];
            let scale = img.width() as f32 / base_w;
            let (x, y) = rec.position();
            let cx = (x + 0.5) * scale - 0.5;
            let cy = (y + 0.5) * scale - 0.5;

            let (mut m10, mut m01) = (0.0f32, 0.0f32);
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx * dx + dy * dy > r * r {
                        continue;
                    }
                    let v = interpolate_bilinear(img, cx + dx as f32, cy + dy as f32);
                    m10 += dx as f32 * v;
                    m01 += dy as f32 * v;
                }
            }
            rec.rotation = encode_rotation(m01.atan2(m10));
            rec.write(&mut bytes[offset..]);
        }
        offset += stride;
    }
    Ok(write_bytes(ctx.width, ctx.height, &bytes))
}
