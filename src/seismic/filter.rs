//! JMA measured-intensity band filter.
//!
//! Frequency-domain weighting applied per axis before the three axes are
//! mixed: a low-cut term suppressing sub-0.5 Hz drift, a high-cut
//! polynomial rolling off above ~10 Hz, and a 1/sqrt(f) amplitude
//! correction. Bins below 0.1 mHz are zeroed, which also removes the DC
//! component and keeps the later log10 off zero-energy windows.

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

/// Filter one axis and return the real part of the reconstruction.
pub fn filter_axis(samples: &[f64], fs: f64) -> Vec<f64> {
    let n = samples.len();
    if n == 0 {
        return Vec::new();
    }

    let mut planner = FftPlanner::new();
    let mut buf: Vec<Complex<f64>> = samples.iter().map(|&s| Complex::new(s, 0.0)).collect();
    planner.plan_fft_forward(n).process(&mut buf);

    for (i, bin) in buf.iter_mut().enumerate() {
        let f = bin_frequency(i, n, fs).abs();
        if f < 1e-4 {
            *bin = Complex::new(0.0, 0.0);
            continue;
        }
        let lcf = (1.0 - (-(f / 0.5).powi(3)).exp()).sqrt();
        let y = f * 0.1;
        let hcf = (1.0
            + 0.694 * y.powi(2)
            + 0.241 * y.powi(4)
            + 0.0557 * y.powi(6)
            + 0.009_664 * y.powi(8)
            + 0.001_34 * y.powi(10)
            + 0.000_155 * y.powi(12))
        .powf(-0.5);
        *bin *= lcf * hcf * (1.0 / f).sqrt();
    }

    planner.plan_fft_inverse(n).process(&mut buf);

    // rustfft leaves both directions unnormalised.
    let norm = 1.0 / n as f64;
    buf.iter().map(|c| c.re * norm).collect()
}

/// Signed frequency of FFT bin `i` in the numpy `fftfreq` layout:
/// `[0, 1, .., n/2-1, -n/2, .., -1] * fs / n`.
fn bin_frequency(i: usize, n: usize, fs: f64) -> f64 {
    let i = i as i64;
    let n = n as i64;
    let k = if i < (n + 1) / 2 { i } else { i - n };
    k as f64 * fs / n as f64
}

/// Pointwise Euclidean norm of the three filtered axes.
pub fn mix_axes(x: &[f64], y: &[f64], z: &[f64]) -> Vec<f64> {
    x.iter()
        .zip(y)
        .zip(z)
        .map(|((&a, &b), &c)| (a * a + b * b + c * c).sqrt())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_frequency_matches_fftfreq_layout() {
        // n = 8, fs = 8 Hz: [0, 1, 2, 3, -4, -3, -2, -1]
        let freqs: Vec<f64> = (0..8).map(|i| bin_frequency(i, 8, 8.0)).collect();
        assert_eq!(freqs, vec![0.0, 1.0, 2.0, 3.0, -4.0, -3.0, -2.0, -1.0]);
    }

    #[test]
    fn zero_input_stays_zero() {
        let out = filter_axis(&[0.0; 128], 100.0);
        assert!(out.iter().all(|&v| v.abs() < 1e-12));
    }

    #[test]
    fn dc_component_is_removed() {
        let out = filter_axis(&[5.0; 256], 100.0);
        assert!(out.iter().all(|&v| v.abs() < 1e-9));
    }

    #[test]
    fn five_hz_gain_is_attenuated() {
        // At 5 Hz the combined weight is lcf(≈1) · hcf(≈0.917) · (1/5)^0.5,
        // about 0.41 — a bin-aligned sinusoid comes back scaled by that.
        let fs = 100.0;
        let n = 400; // 5 Hz falls exactly on bin 20
        let input: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * 5.0 * i as f64 / fs).sin())
            .collect();
        let out = filter_axis(&input, fs);
        let peak = out.iter().cloned().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!((peak - 0.41).abs() < 0.03, "peak gain {peak}");
    }

    #[test]
    fn mix_is_euclidean_norm() {
        let mix = mix_axes(&[3.0], &[4.0], &[0.0]);
        assert!((mix[0] - 5.0).abs() < 1e-12);
    }
}
