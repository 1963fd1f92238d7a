// image.rs — Host-side image container, generic over pixel type.
//
// Two pixel types matter in this crate:
//
//   u8    greyscale camera frames handed in by the caller.
//   Rgba  four f32 channels, the texel format of every compute texture.
//           Encoded keypoint textures store bytes as `byte / 255` per
//           channel, so a texel round-trips through `Rgba::to_bytes`.
//
// Images are row-major with no stride padding. The CPU backend stores its
// textures as `Image<Rgba>`; the wgpu backend only touches host images at
// upload and readback time.
//
// NEW RUST CONCEPTS:
// - Trait with associated behaviour implemented for a newtype (`Rgba`).
// - `impl Iterator` return types.
// - `Index<(usize, usize)>` for `img[(x, y)]` syntax.

use std::fmt;

// ---------------------------------------------------------------------------
// Pixel trait
// ---------------------------------------------------------------------------

/// Types that can be stored in an `Image`.
///
/// `to_f32` gives the scalar "intensity" of a pixel. For `Rgba` that is the
/// red channel, which is where every greyscale kernel keeps luminance.
pub trait Pixel: Copy + Default + Send + Sync + PartialEq + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Pixel for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 255.0).round() as u8
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

/// One RGBA texel with f32 channels. Same layout as `[f32; 4]`, so texel
/// slices can be handed to a device as bytes.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Rgba(pub [f32; 4]);

impl Rgba {
    pub const ZERO: Rgba = Rgba([0.0; 4]);

    #[inline]
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Rgba([r, g, b, a])
    }

    /// A grey texel: luminance in r, g and b, opaque alpha.
    #[inline]
    pub fn grey(v: f32) -> Self {
        Rgba([v, v, v, 1.0])
    }

    #[inline]
    pub fn r(&self) -> f32 {
        self.0[0]
    }

    #[inline]
    pub fn g(&self) -> f32 {
        self.0[1]
    }

    #[inline]
    pub fn b(&self) -> f32 {
        self.0[2]
    }

    #[inline]
    pub fn a(&self) -> f32 {
        self.0[3]
    }

    /// Quantise each channel to a byte: `round(clamp(v, 0, 1) * 255)`.
    /// This is what a readback of an 8-bit-per-channel texture returns.
    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Rgba(bytes.map(|b| b as f32 / 255.0))
    }
}

impl Pixel for Rgba {
    #[inline]
    fn to_f32(self) -> f32 {
        self.0[0]
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        Rgba::grey(v)
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D image with runtime dimensions.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    data: Vec<T>,
    width: usize,
    height: usize,
}

impl<T: Pixel> Image<T> {
    /// Zero-initialised image.
    pub fn new(width: usize, height: usize) -> Self {
        Image {
            data: vec![T::default(); width * height],
            width,
            height,
        }
    }

    /// Image filled with one value.
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Image {
            data: vec![value; width * height],
            width,
            height,
        }
    }

    /// Wrap an existing row-major pixel vector.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height }
    }

    /// Build an image by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Image { data, width, height }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Pixel at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.bounds_check(x, y);
        self.data[y * self.width + x] = value;
    }

    /// Pixel at a signed position, clamped to the nearest edge pixel.
    ///
    /// # Panics
    /// Panics on an empty image.
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> T {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.data[cy * self.width + cx]
    }

    /// Pixel at a signed position, mirrored about the edge pixel
    /// (`-1 → 1`, `w → w - 2`). Mirroring keeps the phase of zero-stuffed
    /// images intact at the borders, which clamping does not.
    #[inline]
    pub fn get_reflected(&self, x: isize, y: isize) -> T {
        let cx = reflect(x, self.width);
        let cy = reflect(y, self.height);
        self.data[cy * self.width + cx]
    }

    /// Pixel at (x, y) or `None` outside the image.
    #[inline]
    pub fn try_get(&self, x: isize, y: isize) -> Option<T> {
        if x < 0 || y < 0 || x >= self.width as isize || y >= self.height as isize {
            None
        } else {
            Some(self.data[y as usize * self.width + x as usize])
        }
    }

    /// One row as a slice.
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        &self.data[y * self.width..(y + 1) * self.width]
    }

    /// Iterate over `(x, y, value)` in raster order.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        let w = self.width;
        self.data
            .iter()
            .enumerate()
            .map(move |(i, &v)| (i % w, i / w, v))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Apply `f` to every pixel, producing a new image.
    pub fn map<U: Pixel>(&self, f: impl Fn(T) -> U) -> Image<U> {
        Image {
            data: self.data.iter().map(|&v| f(v)).collect(),
            width: self.width,
            height: self.height,
        }
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

impl Image<Rgba> {
    /// Greyscale texels from an 8-bit frame: `v / 255` in r, g, b.
    pub fn from_grey(src: &Image<u8>) -> Self {
        src.map(|v| Rgba::grey(v as f32 / 255.0))
    }

    /// The red channel, quantised back to 8 bits.
    pub fn to_grey(&self) -> Image<u8> {
        self.map(|t| u8::from_f32(t.r() * 255.0))
    }

    /// Row-major RGBA bytes, 4 per texel.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|t| t.to_bytes()).collect()
    }

    /// Inverse of `to_bytes`. Missing trailing bytes read as zero.
    pub fn from_bytes(width: usize, height: usize, bytes: &[u8]) -> Self {
        Image::from_fn(width, height, |x, y| {
            let i = (y * width + x) * 4;
            let mut px = [0u8; 4];
            for (c, slot) in px.iter_mut().enumerate() {
                *slot = bytes.get(i + c).copied().unwrap_or(0);
            }
            Rgba::from_bytes(px)
        })
    }
}

#[inline]
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let mut m = i.rem_euclid(period);
    if m >= n {
        m = period - m;
    }
    m as usize
}

impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}×{} }}",
            std::any::type_name::<T>(),
            self.width,
            self.height,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(8) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 8 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl<T: Pixel> std::ops::Index<(usize, usize)> for Image<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &T {
        self.bounds_check(x, y);
        &self.data[y * self.width + x]
    }
}

impl<T: Pixel> std::ops::IndexMut<(usize, usize)> for Image<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.width + x;
        &mut self.data[idx]
    }
}

// ---------------------------------------------------------------------------
// Bilinear interpolation
// ---------------------------------------------------------------------------

/// Bilinear sample of the pixel intensity (`Pixel::to_f32`) at sub-pixel
/// (x, y). Coordinates outside the image clamp to the edge.
///
/// # Panics
/// Panics if the image is empty.
pub fn interpolate_bilinear<T: Pixel>(img: &Image<T>, x: f32, y: f32) -> f32 {
    assert!(!img.is_empty(), "cannot interpolate on an empty image");

    let x = x.clamp(0.0, (img.width() - 1) as f32);
    let y = y.clamp(0.0, (img.height() - 1) as f32);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);

    let p00 = img.get(x0, y0).to_f32();
    let p10 = img.get(x1, y0).to_f32();
    let p01 = img.get(x0, y1).to_f32();
    let p11 = img.get(x1, y1).to_f32();

    (1.0 - fx) * (1.0 - fy) * p00 + fx * (1.0 - fy) * p10 + (1.0 - fx) * fy * p01 + fx * fy * p11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_set() {
        let mut img: Image<u8> = Image::new(4, 3);
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 3);
        img.set(3, 2, 255);
        assert_eq!(img.get(3, 2), 255);
        assert_eq!(img[(0, 0)], 0);
    }

    #[test]
    fn test_from_fn_raster_order() {
        let img = Image::from_fn(3, 2, |x, y| (y * 3 + x) as u8);
        assert_eq!(img.row(1), &[3, 4, 5]);
        let pixels: Vec<_> = img.pixels().collect();
        assert_eq!(pixels[4], (1, 1, 4));
    }

    #[test]
    fn test_reflected_borders() {
        let img = Image::from_vec(4, 1, vec![10u8, 20, 30, 40]);
        assert_eq!(img.get_reflected(-1, 0), 20);
        assert_eq!(img.get_reflected(-2, 0), 30);
        assert_eq!(img.get_reflected(4, 0), 30);
        assert_eq!(img.get_reflected(5, 0), 20);
        assert_eq!(img.get_clamped(9, 0), 40);
        assert_eq!(img.try_get(4, 0), None);
    }

    #[test]
    fn test_rgba_bytes_roundtrip() {
        let bytes: Vec<u8> = (0..16).map(|i| (i * 17) as u8).collect();
        let img = Image::<Rgba>::from_bytes(2, 2, &bytes);
        assert_eq!(img.to_bytes(), bytes);
    }

    #[test]
    fn test_grey_conversion() {
        let grey = Image::from_vec(2, 1, vec![0u8, 255]);
        let rgba = Image::<Rgba>::from_grey(&grey);
        assert_eq!(rgba.get(1, 0), Rgba::grey(1.0));
        assert_eq!(rgba.to_grey(), grey);
    }

    #[test]
    fn test_bilinear_midpoint() {
        let img = Image::from_vec(2, 2, vec![0.0f32, 10.0, 20.0, 30.0]);
        assert!((interpolate_bilinear(&img, 0.5, 0.5) - 15.0).abs() < 1e-6);
        // Clamped outside.
        assert!((interpolate_bilinear(&img, 5.0, 5.0) - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_bilinear_reads_red_channel() {
        let img = Image::from_vec(2, 1, vec![Rgba::new(0.0, 9.0, 9.0, 9.0), Rgba::new(1.0, 9.0, 9.0, 9.0)]);
        assert!((interpolate_bilinear(&img, 0.25, 0.0) - 0.25).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_out_of_bounds() {
        let img: Image<u8> = Image::new(4, 4);
        img.get(4, 0);
    }
}
