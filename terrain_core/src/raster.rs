//! Flat row-major rasters shared by every analysis and synthesis stage.

use serde::{Deserialize, Serialize};

/// Scalar elevation grid in meters.
pub type Heightfield = Raster<f32>;
/// Per-pixel 2D vectors (gradients, gradient means).
pub type VectorField = Raster<[f32; 2]>;
/// Per-pixel `[min, max]` pairs.
pub type RangeField = Raster<[f32; 2]>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster<T> {
    width: usize,
    height: usize,
    values: Vec<T>,
}

impl<T> Raster<T> {
    pub fn new(width: usize, height: usize, values: Vec<T>) -> Self {
        debug_assert_eq!(values.len(), width * height);
        Self {
            width,
            height,
            values,
        }
    }

    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            values: Vec::new(),
        }
    }

    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut values = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                values.push(f(x, y));
            }
        }
        Self::new(width, height, values)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<T> {
        self.values
    }

    #[inline]
    pub fn idx(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.width && y < self.height);
        y * self.width + x
    }

    #[inline]
    pub fn contains(&self, x: isize, y: isize) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }

    pub fn same_size<U>(&self, other: &Raster<U>) -> bool {
        self.width == other.width && self.height == other.height
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(0, 0, self.width as isize, self.height as isize)
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> Raster<U> {
        Raster::new(self.width, self.height, self.values.iter().map(&mut f).collect())
    }
}

impl<T> Default for Raster<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Copy> Raster<T> {
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Self::new(width, height, vec![value; width * height])
    }

    #[inline]
    pub fn sample(&self, x: usize, y: usize) -> T {
        self.values[self.idx(x, y)]
    }

    #[inline]
    pub fn get(&self, x: isize, y: isize) -> Option<T> {
        if self.contains(x, y) {
            Some(self.values[y as usize * self.width + x as usize])
        } else {
            None
        }
    }

    /// Sample with coordinates clamped to the raster edge. Panics on an empty raster.
    #[inline]
    pub fn clamped(&self, x: isize, y: isize) -> T {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.values[cy * self.width + cx]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let i = self.idx(x, y);
        self.values[i] = value;
    }

    /// Copy out the `bounds` window; cells outside the raster take `fill`.
    pub fn window(&self, bounds: Bounds, fill: T) -> Raster<T> {
        Raster::from_fn(bounds.width(), bounds.height(), |x, y| {
            self.get(bounds.x0 + x as isize, bounds.y0 + y as isize)
                .unwrap_or(fill)
        })
    }
}

impl Raster<f32> {
    pub fn sum(&self) -> f64 {
        self.values.iter().map(|&v| v as f64).sum()
    }

    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        (self.sum() / self.values.len() as f64) as f32
    }

    pub fn min_max(&self) -> Option<(f32, f32)> {
        let mut iter = self.values.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }

    /// Bilinear lookup in pixel coordinates, clamped at the edges.
    pub fn bilinear(&self, fx: f32, fy: f32) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let fx = fx.clamp(0.0, max_x);
        let fy = fy.clamp(0.0, max_y);
        let x0 = fx.floor() as usize;
        let y0 = fy.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let tx = fx - x0 as f32;
        let ty = fy - y0 as f32;
        let top = lerp(self.sample(x0, y0), self.sample(x1, y0), tx);
        let bottom = lerp(self.sample(x0, y1), self.sample(x1, y1), tx);
        lerp(top, bottom, ty)
    }
}

/// Half-open pixel rectangle `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub x0: isize,
    pub y0: isize,
    pub x1: isize,
    pub y1: isize,
}

impl Bounds {
    pub fn new(x0: isize, y0: isize, x1: isize, y1: isize) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn point(x: isize, y: isize) -> Self {
        Self::new(x, y, x + 1, y + 1)
    }

    /// Square of `size` pixels whose `size / 2` cell lands on the center.
    pub fn centered(cx: isize, cy: isize, size: usize) -> Self {
        let half = (size / 2) as isize;
        Self::new(cx - half, cy - half, cx - half + size as isize, cy - half + size as isize)
    }

    pub fn width(&self) -> usize {
        (self.x1 - self.x0).max(0) as usize
    }

    pub fn height(&self) -> usize {
        (self.y1 - self.y0).max(0) as usize
    }

    pub fn area(&self) -> usize {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    pub fn contains(&self, x: isize, y: isize) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    pub fn include(&mut self, x: isize, y: isize) {
        self.x0 = self.x0.min(x);
        self.y0 = self.y0.min(y);
        self.x1 = self.x1.max(x + 1);
        self.y1 = self.y1.max(y + 1);
    }

    pub fn expanded(&self, by: isize) -> Self {
        Self::new(self.x0 - by, self.y0 - by, self.x1 + by, self.y1 + by)
    }

    pub fn clipped(&self, other: &Bounds) -> Self {
        Self::new(
            self.x0.max(other.x0),
            self.y0.max(other.y0),
            self.x1.min(other.x1).max(self.x0.max(other.x0)),
            self.y1.min(other.y1).max(self.y0.max(other.y0)),
        )
    }
}

/// Finite-difference gradient, expressed as elevation change per meter.
pub fn gradient(elevation: &Heightfield, meters_per_sample: f32) -> VectorField {
    let w = elevation.width();
    let h = elevation.height();
    if elevation.is_empty() {
        return Raster::empty();
    }
    Raster::from_fn(w, h, |x, y| {
        let xl = x.saturating_sub(1);
        let xr = (x + 1).min(w - 1);
        let yu = y.saturating_sub(1);
        let yd = (y + 1).min(h - 1);
        let gx = if xr > xl {
            (elevation.sample(xr, y) - elevation.sample(xl, y))
                / ((xr - xl) as f32 * meters_per_sample)
        } else {
            0.0
        };
        let gy = if yd > yu {
            (elevation.sample(x, yd) - elevation.sample(x, yu))
                / ((yd - yu) as f32 * meters_per_sample)
        } else {
            0.0
        };
        [gx, gy]
    })
}

pub fn magnitude(v: [f32; 2]) -> f32 {
    (v[0] * v[0] + v[1] * v[1]).sqrt()
}

fn resampled_dim(size: usize, factor: f32) -> usize {
    ((size as f32 * factor).round() as usize).max(1)
}

/// Bilinear resample by `factor` (>1 upsamples, <1 downsamples).
pub fn resample_bilinear(source: &Heightfield, factor: f32) -> Heightfield {
    if source.is_empty() || factor <= 0.0 {
        return Raster::empty();
    }
    resample_bilinear_to(
        source,
        resampled_dim(source.width(), factor),
        resampled_dim(source.height(), factor),
    )
}

/// Bilinear resample to an exact `width × height`.
pub fn resample_bilinear_to(source: &Heightfield, width: usize, height: usize) -> Heightfield {
    if source.is_empty() || width == 0 || height == 0 {
        return Raster::empty();
    }
    let fx = source.width() as f32 / width as f32;
    let fy = source.height() as f32 / height as f32;
    Raster::from_fn(width, height, |x, y| {
        source.bilinear((x as f32 + 0.5) * fx - 0.5, (y as f32 + 0.5) * fy - 0.5)
    })
}

/// Nearest-neighbour resample, used for categorical rasters.
pub fn resample_nearest<T: Copy>(source: &Raster<T>, factor: f32) -> Raster<T> {
    if source.is_empty() || factor <= 0.0 {
        return Raster::empty();
    }
    let w = resampled_dim(source.width(), factor);
    let h = resampled_dim(source.height(), factor);
    let fx = source.width() as f32 / w as f32;
    let fy = source.height() as f32 / h as f32;
    Raster::from_fn(w, h, |x, y| {
        let sx = (((x as f32 + 0.5) * fx) as usize).min(source.width() - 1);
        let sy = (((y as f32 + 0.5) * fy) as usize).min(source.height() - 1);
        source.sample(sx, sy)
    })
}

/// Separable gaussian blur with clamped edges.
pub fn gaussian_blur(source: &Heightfield, sigma: f32) -> Heightfield {
    if sigma <= f32::EPSILON || source.is_empty() {
        return source.clone();
    }
    let radius = (sigma * 3.0).ceil() as isize;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|d| (-(d * d) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let norm: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= norm;
    }

    let w = source.width();
    let h = source.height();
    let horizontal = Raster::from_fn(w, h, |x, y| {
        kernel
            .iter()
            .enumerate()
            .map(|(i, k)| k * source.clamped(x as isize + i as isize - radius, y as isize))
            .sum::<f32>()
    });
    Raster::from_fn(w, h, |x, y| {
        kernel
            .iter()
            .enumerate()
            .map(|(i, k)| k * horizontal.clamped(x as isize, y as isize + i as isize - radius))
            .sum::<f32>()
    })
}

/// Root-mean-square difference between two equally sized heightfields.
pub fn rms_difference(a: &Heightfield, b: &Heightfield) -> f32 {
    if a.is_empty() || !a.same_size(b) {
        return 0.0;
    }
    let sum: f64 = a
        .values()
        .iter()
        .zip(b.values())
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum();
    (sum / a.len() as f64).sqrt() as f32
}

pub(crate) fn neighbors4(
    x: usize,
    y: usize,
    w: usize,
    h: usize,
) -> impl Iterator<Item = (usize, usize)> {
    let mut v = Vec::with_capacity(4);
    if x > 0 {
        v.push((x - 1, y));
    }
    if x + 1 < w {
        v.push((x + 1, y));
    }
    if y > 0 {
        v.push((x, y - 1));
    }
    if y + 1 < h {
        v.push((x, y + 1));
    }
    v.into_iter()
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}
