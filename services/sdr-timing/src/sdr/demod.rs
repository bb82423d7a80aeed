//! Conversion of raw RTL-SDR bytes to complex samples
//!
//! RTL-SDR outputs 8-bit unsigned IQ samples (I, Q pairs) centered on 127.5.

use num_complex::Complex32;

/// Pre-computed lookup table for u8 → normalized f32 conversion
pub struct IqTable {
    table: [f32; 256],
}

impl IqTable {
    /// Maps 0..=255 onto -1.0..=1.0
    pub fn new() -> Self {
        let mut table = [0.0f32; 256];
        for (i, value) in table.iter_mut().enumerate() {
            *value = (i as f32 - 127.5) / 127.5;
        }
        Self { table }
    }

    #[inline(always)]
    pub fn sample(&self, i: u8, q: u8) -> Complex32 {
        Complex32::new(self.table[i as usize], self.table[q as usize])
    }

    /// Convert interleaved IQ bytes, appending to `output`. A trailing odd byte
    /// is ignored; callers keep it for the next chunk.
    pub fn extend_samples(&self, iq_data: &[u8], output: &mut Vec<Complex32>) {
        output.reserve(iq_data.len() / 2);
        output.extend(
            iq_data
                .chunks_exact(2)
                .map(|pair| self.sample(pair[0], pair[1])),
        );
    }
}

impl Default for IqTable {
    fn default() -> Self {
        Self::new()
    }
}
