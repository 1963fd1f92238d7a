// cpu/trackers.rs — Pyramidal Lucas-Kanade over encoded keypoints.
//
// Both kernels read an encoded keypoint texture and write a copy of it with
// some records changed. They only touch the slot range
// [firstKeypointIndex, lastKeypointIndex]; everything else is copied
// through, so a long list can be tracked in batches with each batch's
// output feeding the next.
//
//   lk          forward-additive LK, coarse-to-fine over `depth` levels
//               that shrink by `levelScale` each. Writes the new position, or the discard marker if the
//               solve is singular or the point leaves the image.
//   lk-discard  compares the window around the old position in the previous
//               frame with the window around the new position in the next
//               frame; a mean squared residual above the threshold marks the
//               keypoint as lost.
//
// Intensities are scaled to [0, 255] inside the solver so the singular-
// Hessian threshold behaves the same as on 8-bit images.

use crate::error::Result;
use crate::image::{interpolate_bilinear, Image, Rgba};
use crate::keypoint::{pixels_per_keypoint, KeypointRecord, MAX_DESCRIPTOR_SIZE};

use super::encoders::{read_bytes, write_bytes};
use super::KernelContext;

/// Gauss-Newton iterations per level.
const MAX_ITERATIONS: usize = 30;

/// Convergence threshold on the update step, in pixels.
const EPSILON: f32 = 0.01;

/// Below this the 2×2 structure tensor is treated as singular.
const MIN_DETERMINANT: f32 = 1e-6;

/// Slot range and layout shared by both kernels.
struct Batch {
    stride: usize,
    first: usize,
    last: usize,
}

impl Batch {
    fn parse(ctx: &KernelContext<'_>, ds_arg: usize) -> Result<Batch> {
        let descriptor_size = ctx.int_in(ds_arg, 0..=MAX_DESCRIPTOR_SIZE as i32)? as usize;
        let first = ctx.int_in(ds_arg + 1, 0..=i32::MAX)? as usize;
        let last = ctx.int_in(ds_arg + 2, 0..=i32::MAX)? as usize;
        Ok(Batch {
            stride: pixels_per_keypoint(descriptor_size) * 4,
            first,
            last,
        })
    }

    /// Visit every live record in the batch range, in slot order, stopping
    /// at the sentinel. `f` may rewrite the record in place.
    fn for_each(&self, bytes: &mut [u8], mut f: impl FnMut(usize, &mut KeypointRecord)) {
        let slots = bytes.len() / self.stride;
        for slot in 0..slots.min(self.last.saturating_add(1)) {
            let offset = slot * self.stride;
            let mut rec = KeypointRecord::read(&bytes[offset..]);
            if rec.is_sentinel() {
                break;
            }
            if slot < self.first || rec.is_discarded() || rec.is_noise() {
                continue;
            }
            f(slot, &mut rec);
            rec.write(&mut bytes[offset..]);
        }
    }
}

fn window_size(ctx: &KernelContext<'_>, arg: usize) -> Result<usize> {
    let max = ctx.spec.define("MAX_WINDOW_SIZE").unwrap_or(21.0) as i32;
    let ws = ctx.int_in(arg, 1..=max)?;
    if ws % 2 == 0 {
        return Err(ctx.invalid(format!("window size must be odd, got {ws}")));
    }
    Ok(ws as usize)
}

// ---------------------------------------------------------------------------
// trackers/lk
// ---------------------------------------------------------------------------

/// Arguments: keypoints, next pyramid, previous pyramid, window size, depth,
/// level scale, descriptor size, first keypoint index, last keypoint index.
pub(crate) fn lk(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let keypoints = ctx.image(0)?;
    let next = ctx.images(1)?;
    let prev = ctx.images(2)?;
    let ws = window_size(ctx, 3)?;
    let depth = ctx.int_in(4, 1..=i32::MAX)? as usize;
    let level_scale = ctx.float(5)?;
    if !(1.0..=2.0).contains(&level_scale) {
        return Err(ctx.invalid(format!("level scale must be in [1, 2], got {level_scale}")));
    }
    let batch = Batch::parse(ctx, 6)?;

    let levels = depth.min(next.len()).min(prev.len());
    let (w, h) = (next[0].width() as f32, next[0].height() as f32);
    let mut bytes = read_bytes(keypoints);

    batch.for_each(&mut bytes, |_, rec| {
        let (x, y) = rec.position();
        match track_point(prev, next, levels, level_scale, ws / 2, x, y) {
            Some((nx, ny)) if nx >= 0.0 && ny >= 0.0 && nx < w && ny < h => {
                rec.set_position(nx, ny)
            }
            _ => rec.discard(),
        }
    });
    Ok(write_bytes(ctx.width, ctx.height, &bytes))
}

/// Coarse-to-fine tracking of one point. `None` if any level is singular.
fn track_point(
    prev: &[&Image<Rgba>],
    next: &[&Image<Rgba>],
    levels: usize,
    level_scale: f32,
    half: usize,
    x: f32,
    y: f32,
) -> Option<(f32, f32)> {
    let mut d = (0.0f32, 0.0f32);
    for level in (0..levels).rev() {
        let scale = level_scale.powi(-(level as i32));
        d = lk_forward_additive(prev[level], next[level], x * scale, y * scale, d, half)?;
        if level > 0 {
            d = (d.0 * level_scale, d.1 * level_scale);
        }
    }
    Some((x + d.0, y + d.1))
}

/// Iterative forward-additive LK at one level. Gradients are evaluated at
/// the warped position in the next frame, so the Hessian is rebuilt each
/// iteration.
fn lk_forward_additive(
    prev: &Image<Rgba>,
    next: &Image<Rgba>,
    fx: f32,
    fy: f32,
    (mut dx, mut dy): (f32, f32),
    half: usize,
) -> Option<(f32, f32)> {
    let half = half as isize;
    let sample = |img: &Image<Rgba>, x: f32, y: f32| 255.0 * interpolate_bilinear(img, x, y);

    for _ in 0..MAX_ITERATIONS {
        let (mut h00, mut h01, mut h11) = (0.0f32, 0.0f32, 0.0f32);
        let (mut b0, mut b1) = (0.0f32, 0.0f32);
        for py in -half..=half {
            for px in -half..=half {
                let (px, py) = (px as f32, py as f32);
                let t = sample(prev, fx + px, fy + py);
                let (wx, wy) = (fx + dx + px, fy + dy + py);
                let e = t - sample(next, wx, wy);
                let gx = 0.5 * (sample(next, wx + 1.0, wy) - sample(next, wx - 1.0, wy));
                let gy = 0.5 * (sample(next, wx, wy + 1.0) - sample(next, wx, wy - 1.0));
                h00 += gx * gx;
                h01 += gx * gy;
                h11 += gy * gy;
                b0 += gx * e;
                b1 += gy * e;
            }
        }

        let det = h00 * h11 - h01 * h01;
        if det.abs() < MIN_DETERMINANT {
            return None;
        }
        let inv_det = 1.0 / det;
        let step_x = inv_det * (h11 * b0 - h01 * b1);
        let step_y = inv_det * (h00 * b1 - h01 * b0);
        dx += step_x;
        dy += step_y;
        if step_x * step_x + step_y * step_y < EPSILON * EPSILON {
            break;
        }
    }
    Some((dx, dy))
}

// ---------------------------------------------------------------------------
// trackers/lk-discard
// ---------------------------------------------------------------------------

/// Arguments: keypoints, previous keypoints, next pyramid, previous pyramid,
/// window size, discard threshold, descriptor size, first keypoint index,
/// last keypoint index.
pub(crate) fn lk_discard(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let keypoints = ctx.image(0)?;
    let prev_keypoints = read_bytes(ctx.image(1)?);
    let next = ctx.images(2)?[0];
    let prev = ctx.images(3)?[0];
    let half = (window_size(ctx, 4)? / 2) as isize;
    let threshold = ctx.float(5)?;
    let batch = Batch::parse(ctx, 6)?;

    let mut bytes = read_bytes(keypoints);
    batch.for_each(&mut bytes, |slot, rec| {
        let offset = slot * batch.stride;
        if offset + KeypointRecord::LEN > prev_keypoints.len() {
            return;
        }
        let before = KeypointRecord::read(&prev_keypoints[offset..]);
        if before.is_sentinel() || before.is_discarded() {
            return;
        }
        let (x0, y0) = before.position();
        let (x1, y1) = rec.position();
        let mut sum = 0.0f32;
        for py in -half..=half {
            for px in -half..=half {
                let (px, py) = (px as f32, py as f32);
                let e = interpolate_bilinear(prev, x0 + px, y0 + py)
                    - interpolate_bilinear(next, x1 + px, y1 + py);
                sum += e * e;
            }
        }
        let side = (2 * half + 1) as f32;
        let residual = sum / (side * side);
        // NaN compares false, so test for "not within" rather than "above".
        if !(residual <= threshold) {
            rec.discard();
        }
    });
    Ok(write_bytes(ctx.width, ctx.height, &bytes))
}
