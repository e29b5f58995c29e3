//! Radially binned magnitude spectrum of an elevation raster.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::raster::Heightfield;

pub const DEFAULT_FREQUENCY_BANDS: usize = 10;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrequencySpectrum {
    /// Mean spectral magnitude per equal-width band, lowest frequency first.
    pub bands: Vec<f32>,
    /// Upper edge of the last band (the Nyquist frequency, cycles per meter).
    pub max_frequency: f32,
}

impl FrequencySpectrum {
    pub fn band_width(&self) -> f32 {
        if self.bands.is_empty() {
            0.0
        } else {
            self.max_frequency / self.bands.len() as f32
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    fn mul(self, o: Complex) -> Complex {
        Complex {
            re: self.re * o.re - self.im * o.im,
            im: self.re * o.im + self.im * o.re,
        }
    }

    fn add(self, o: Complex) -> Complex {
        Complex {
            re: self.re + o.re,
            im: self.im + o.im,
        }
    }

    fn sub(self, o: Complex) -> Complex {
        Complex {
            re: self.re - o.re,
            im: self.im - o.im,
        }
    }

    fn norm(self) -> f64 {
        (self.re * self.re + self.im * self.im).sqrt()
    }

    fn unit(angle: f64) -> Complex {
        Complex {
            re: angle.cos(),
            im: angle.sin(),
        }
    }
}

pub fn frequency_spectrum(
    elevation: &Heightfield,
    meters_per_sample: f32,
    band_count: usize,
) -> FrequencySpectrum {
    let nyquist = 1.0 / (2.0 * meters_per_sample);
    let mut spectrum = FrequencySpectrum {
        bands: vec![0.0; band_count],
        max_frequency: nyquist,
    };
    if elevation.is_empty() || band_count == 0 {
        return spectrum;
    }

    let w = elevation.width();
    let h = elevation.height();
    let mut cells: Vec<Complex> = elevation
        .values()
        .iter()
        .map(|&v| Complex {
            re: v as f64,
            im: 0.0,
        })
        .collect();

    let mut row = vec![Complex::default(); w];
    for y in 0..h {
        row.copy_from_slice(&cells[y * w..(y + 1) * w]);
        transform(&mut row);
        cells[y * w..(y + 1) * w].copy_from_slice(&row);
    }
    let mut column = vec![Complex::default(); h];
    for x in 0..w {
        for y in 0..h {
            column[y] = cells[y * w + x];
        }
        transform(&mut column);
        for y in 0..h {
            cells[y * w + x] = column[y];
        }
    }

    let norm = (w * h) as f64;
    let mut sums = vec![0.0f64; band_count];
    let mut counts = vec![0u64; band_count];
    let mps = meters_per_sample as f64;
    let nyquist = 1.0 / (2.0 * mps);
    for ky in 0..h {
        let fy = centred_index(ky, h) as f64 / (h as f64 * mps);
        for kx in 0..w {
            let fx = centred_index(kx, w) as f64 / (w as f64 * mps);
            let radius = (fx * fx + fy * fy).sqrt();
            if radius > nyquist * (1.0 + 1e-9) {
                continue;
            }
            let band = ((radius / nyquist * band_count as f64) as usize).min(band_count - 1);
            sums[band] += cells[ky * w + kx].norm() / norm;
            counts[band] += 1;
        }
    }

    for (band, (sum, count)) in sums.iter().zip(&counts).enumerate() {
        if *count > 0 {
            spectrum.bands[band] = (sum / *count as f64) as f32;
        }
    }
    spectrum
}

/// Signed frequency index after moving the zero frequency to the center.
fn centred_index(k: usize, n: usize) -> isize {
    if k < (n + 1) / 2 {
        k as isize
    } else {
        k as isize - n as isize
    }
}

fn transform(buf: &mut [Complex]) {
    if buf.len().is_power_of_two() {
        fft_radix2(buf);
    } else {
        dft(buf);
    }
}

fn dft(buf: &mut [Complex]) {
    let n = buf.len();
    let input = buf.to_vec();
    for (k, out) in buf.iter_mut().enumerate() {
        let mut acc = Complex::default();
        for (t, value) in input.iter().enumerate() {
            let angle = -2.0 * PI * (k * t % n) as f64 / n as f64;
            acc = acc.add(value.mul(Complex::unit(angle)));
        }
        *out = acc;
    }
}

fn fft_radix2(buf: &mut [Complex]) {
    let n = buf.len();
    if n <= 1 {
        return;
    }
    let bits = n.trailing_zeros();
    for i in 0..n {
        let j = i.reverse_bits() >> (usize::BITS - bits);
        if j > i {
            buf.swap(i, j);
        }
    }
    let mut len = 2;
    while len <= n {
        let step = Complex::unit(-2.0 * PI / len as f64);
        for start in (0..n).step_by(len) {
            let mut twiddle = Complex { re: 1.0, im: 0.0 };
            for i in 0..len / 2 {
                let a = buf[start + i];
                let b = buf[start + i + len / 2].mul(twiddle);
                buf[start + i] = a.add(b);
                buf[start + i + len / 2] = a.sub(b);
                twiddle = twiddle.mul(step);
            }
        }
        len <<= 1;
    }
}
