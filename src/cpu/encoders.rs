// cpu/encoders.rs — Corner map → encoded keypoint texture, and the upload
// path from a host buffer.
//
// Encoding is two passes:
//
//   1. encode-keypoint-offsets: for each pixel, the distance in raster order
//      to the next corner, capped at `maxIterations` (stored in b / 255).
//      A zero means "this pixel is a corner".
//   2. encode-keypoints: walk the image by jumping along those offsets,
//      writing one record per corner until the texture is full, then the
//      sentinel if there is room left.
//
// A larger cap means fewer jumps per walk but more work in pass 1 on a GPU,
// which is the trade-off the codec's tuner explores.

use crate::error::Result;
use crate::image::{Image, Rgba};
use crate::keypoint::{
    encode_lod, encode_rotation, encode_unit, pixels_per_keypoint, KeypointRecord, UploadEntry,
    MAX_DESCRIPTOR_SIZE,
};

use super::KernelContext;

/// Texel bytes of an encoded texture, row-major.
pub(crate) fn read_bytes(img: &Image<Rgba>) -> Vec<u8> {
    img.to_bytes()
}

/// Rebuild a texture of the given size from bytes.
pub(crate) fn write_bytes(width: usize, height: usize, bytes: &[u8]) -> Image<Rgba> {
    Image::from_bytes(width, height, bytes)
}

/// Checks shared by the packing kernels: the output must be square with
/// side `encoder_length`. Returns (side, descriptor size, slot capacity).
fn encoder_geometry(ctx: &KernelContext<'_>, length_arg: usize) -> Result<(usize, usize, usize)> {
    let side = ctx.int_in(length_arg, 1..=i32::MAX)? as usize;
    let descriptor_size = ctx.int_in(length_arg + 1, 0..=MAX_DESCRIPTOR_SIZE as i32)? as usize;
    if ctx.width != side || ctx.height != side {
        return Err(ctx.invalid(format!(
            "output is {}×{} but the encoder length is {side}",
            ctx.width, ctx.height
        )));
    }
    let capacity = side * side / pixels_per_keypoint(descriptor_size);
    Ok((side, descriptor_size, capacity))
}

/// Arguments: corner map, max iterations (1..=255).
pub(crate) fn encode_keypoint_offsets(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let corners = ctx.image(0)?;
    let max_iterations = ctx.int_in(1, 1..=255)? as usize;

    let n = corners.width() * corners.height();
    let src = corners.as_slice();
    let mut out = vec![Rgba::ZERO; n];
    let mut next_corner: Option<usize> = None;
    for i in (0..n).rev() {
        if src[i].r() > 0.0 {
            next_corner = Some(i);
        }
        let offset = next_corner.map_or(max_iterations, |c| (c - i).min(max_iterations));
        out[i] = Rgba([src[i].r(), src[i].g(), offset as f32 / 255.0, 0.0]);
    }
    Ok(Image::from_vec(corners.width(), corners.height(), out))
}

/// Arguments: offsets texture, encoder length, descriptor size.
pub(crate) fn encode_keypoints(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let offsets = ctx.image(0)?;
    let (side, descriptor_size, capacity) = encoder_geometry(ctx, 1)?;
    let stride = pixels_per_keypoint(descriptor_size) * 4;

    let w = offsets.width();
    let n = w * offsets.height();
    let texels = offsets.as_slice();
    let mut bytes = vec![0u8; side * side * 4];

    let mut i = 0;
    let mut slot = 0;
    while i < n && slot < capacity {
        let t = texels[i];
        let jump = (t.b().clamp(0.0, 1.0) * 255.0).round() as usize;
        if jump > 0 {
            i += jump;
            continue;
        }
        let mut rec = KeypointRecord {
            lod: encode_unit(t.g()),
            rotation: encode_rotation(0.0),
            score: encode_unit(t.r()),
            ..Default::default()
        };
        rec.set_position((i % w) as f32, (i / w) as f32);
        rec.write(&mut bytes[slot * stride..]);
        slot += 1;
        i += 1;
    }
    if slot < capacity {
        KeypointRecord::SENTINEL.write(&mut bytes[slot * stride..]);
    }
    Ok(write_bytes(side, side, &bytes))
}

/// Arguments: upload buffer (packed `UploadEntry`s), count, encoder length,
/// descriptor size.
pub(crate) fn upload_keypoints(ctx: &KernelContext<'_>) -> Result<Image<Rgba>> {
    let buffer = ctx.bytes(0)?;
    let count = ctx.int_in(1, 0..=i32::MAX)? as usize;
    let (side, descriptor_size, capacity) = encoder_geometry(ctx, 2)?;
    if count * UploadEntry::SIZE > buffer.len() {
        return Err(ctx.invalid(format!(
            "{count} keypoints but the buffer holds {}",
            buffer.len() / UploadEntry::SIZE
        )));
    }
    if count > capacity {
        return Err(ctx.invalid(format!(
            "{count} keypoints do not fit an encoder of capacity {capacity}"
        )));
    }
    let stride = pixels_per_keypoint(descriptor_size) * 4;
    let mut bytes = vec![0u8; side * side * 4];
    for (slot, chunk) in buffer.chunks_exact(UploadEntry::SIZE).take(count).enumerate() {
        let e: UploadEntry = bytemuck::pod_read_unaligned(chunk);
        let mut rec = KeypointRecord {
            lod: encode_lod(e.lod()),
            rotation: encode_rotation(0.0),
            score: encode_unit(e.score),
            ..Default::default()
        };
        rec.set_position(e.x, e.y);
        rec.write(&mut bytes[slot * stride..]);
    }
    if count < capacity {
        KeypointRecord::SENTINEL.write(&mut bytes[count * stride..]);
    }
    Ok(write_bytes(side, side, &bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ComputeBackend, KernelArg, KernelSettings, KernelSpec};
    use crate::cpu::CpuBackend;

    #[test]
    fn test_offsets_are_capped_distances() {
        let mut cpu = CpuBackend::new();
        let mut img = Image::new(10, 1);
        img.set(7, 0, Rgba([0.5, 1.0, 0.0, 0.0]));
        let t = cpu.upload(10, 1, img.as_slice()).unwrap();
        let spec = KernelSpec::new("encoders/encode-keypoint-offsets")
            .with_arguments(&["image", "maxIterations"]);
        let k = cpu.create_kernel("offsets", &spec, &KernelSettings::default()).unwrap();
        let out = cpu.invoke(k, &[KernelArg::Texture(t), KernelArg::Int(4)]).unwrap();
        let offs: Vec<u8> = cpu
            .texels(out)
            .unwrap()
            .as_slice()
            .iter()
            .map(|p| p.to_bytes()[2])
            .collect();
        assert_eq!(offs, vec![4, 4, 4, 4, 3, 2, 1, 0, 4, 4]);
    }

    #[test]
    fn test_max_iterations_out_of_range() {
        let mut cpu = CpuBackend::new();
        let t = cpu.upload(2, 2, &[Rgba::ZERO; 4]).unwrap();
        let spec = KernelSpec::new("encoders/encode-keypoint-offsets")
            .with_arguments(&["image", "maxIterations"]);
        let k = cpu.create_kernel("offsets", &spec, &KernelSettings::default()).unwrap();
        assert!(cpu.invoke(k, &[KernelArg::Texture(t), KernelArg::Int(0)]).is_err());
        assert!(cpu.invoke(k, &[KernelArg::Texture(t), KernelArg::Int(256)]).is_err());
    }

    #[test]
    fn test_encoder_fills_to_capacity_without_sentinel() {
        // 3 corners, side 2 (4 texels) = capacity 2 with descriptor size 0.
        let mut cpu = CpuBackend::new();
        let mut img = Image::new(4, 4);
        for x in [0, 2, 3] {
            img.set(x, 1, Rgba([1.0, 1.0, 0.0, 0.0]));
        }
        let t = cpu.upload(4, 4, img.as_slice()).unwrap();
        let off = cpu
            .create_kernel(
                "offsets",
                &KernelSpec::new("encoders/encode-keypoint-offsets")
                    .with_arguments(&["image", "maxIterations"]),
                &KernelSettings::default(),
            )
            .unwrap();
        let enc = cpu
            .create_kernel(
                "encode",
                &KernelSpec::new("encoders/encode-keypoints")
                    .with_arguments(&["offsets", "encoderLength", "descriptorSize"]),
                &KernelSettings::has_texture_size(2, 2),
            )
            .unwrap();
        let o = cpu.invoke(off, &[KernelArg::Texture(t), KernelArg::Int(3)]).unwrap();
        let e = cpu
            .invoke(enc, &[KernelArg::Texture(o), KernelArg::Int(2), KernelArg::Int(0)])
            .unwrap();
        let bytes = cpu.read_pixels(e).unwrap();
        let first = KeypointRecord::read(&bytes[0..]);
        let second = KeypointRecord::read(&bytes[8..]);
        assert_eq!(first.position(), (0.0, 1.0));
        assert_eq!(second.position(), (2.0, 1.0));
        assert_eq!(first.lod, 255);
        assert_eq!(first.score, 255);
    }
}
