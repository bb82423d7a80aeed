//! Test pulses and sample conditioning for delay measurement

use num_complex::Complex32;
use std::f32::consts::PI;

/// Band-limited sinc pulse of `num_samples` spanning `-width..=width` zero
/// crossings, scaled by `scale`
pub fn sinc_pulse(num_samples: usize, width: f32, scale: f32) -> Vec<Complex32> {
    if num_samples == 0 {
        return Vec::new();
    }
    let step = if num_samples > 1 {
        2.0 * width / (num_samples - 1) as f32
    } else {
        0.0
    };
    (0..num_samples)
        .map(|i| {
            let t = -width + i as f32 * step;
            let v = if t.abs() < 1e-6 { 1.0 } else { (PI * t).sin() / (PI * t) };
            Complex32::new(v * scale, 0.0)
        })
        .collect()
}

/// Subtract the mean in place
pub fn remove_dc(samples: &mut [Complex32]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().sum::<Complex32>() / samples.len() as f32;
    for s in samples.iter_mut() {
        *s -= mean;
    }
}

/// DC removed, magnitude taken and scaled so the peak is 1.0
pub fn normalize(samples: &[Complex32]) -> Vec<f32> {
    let mut centered = samples.to_vec();
    remove_dc(&mut centered);
    let mut mags: Vec<f32> = centered.iter().map(|s| s.norm()).collect();
    let peak = mags.iter().copied().fold(0.0f32, f32::max);
    if peak > 0.0 {
        mags.iter_mut().for_each(|m| *m /= peak);
    }
    mags
}
