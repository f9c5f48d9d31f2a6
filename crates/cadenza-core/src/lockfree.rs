//! Lock-free primitives shared between the audio thread and the main thread.

use atomic_float::{AtomicF32, AtomicF64};
use std::sync::atomic::Ordering;

/// Cache-line aligned atomic f32.
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicFloat {
    value: AtomicF32,
}

impl AtomicFloat {
    pub fn new(value: f32) -> Self {
        Self {
            value: AtomicF32::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> f32 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn swap(&self, value: f32) -> f32 {
        self.value.swap(value, Ordering::AcqRel)
    }

    /// Raw storage for foreign code that reads and writes the value in place.
    pub fn as_ptr(&self) -> *mut f32 {
        self.value.as_atomic_bits().as_ptr().cast()
    }
}

impl Clone for AtomicFloat {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl Default for AtomicFloat {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Cache-line aligned atomic f64.
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicDouble {
    value: AtomicF64,
}

impl AtomicDouble {
    pub fn new(value: f64) -> Self {
        Self {
            value: AtomicF64::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> f64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.value.store(value, Ordering::Release);
    }
}

impl Default for AtomicDouble {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Per-slot peak meters: input left/right, output left/right.
#[derive(Debug, Default)]
pub struct PeakMeters {
    in_left: AtomicFloat,
    in_right: AtomicFloat,
    out_left: AtomicFloat,
    out_right: AtomicFloat,
}

fn block_peak(buffer: &[f32]) -> f32 {
    buffer.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}

impl PeakMeters {
    /// Store the absolute peaks of one processed block.
    ///
    /// Mono sources feed both sides.
    pub fn update(&self, inputs: &[Vec<f32>], outputs: &[Vec<f32>], frames: usize) {
        let (in_l, in_r) = stereo_peaks(inputs, frames);
        let (out_l, out_r) = stereo_peaks(outputs, frames);
        self.in_left.set(in_l);
        self.in_right.set(in_r);
        self.out_left.set(out_l);
        self.out_right.set(out_r);
    }

    pub fn snapshot(&self) -> [f32; 4] {
        [
            self.in_left.get(),
            self.in_right.get(),
            self.out_left.get(),
            self.out_right.get(),
        ]
    }

    pub fn reset(&self) {
        self.in_left.set(0.0);
        self.in_right.set(0.0);
        self.out_left.set(0.0);
        self.out_right.set(0.0);
    }
}

fn stereo_peaks(buffers: &[Vec<f32>], frames: usize) -> (f32, f32) {
    match buffers {
        [] => (0.0, 0.0),
        [mono] => {
            let peak = block_peak(&mono[..frames.min(mono.len())]);
            (peak, peak)
        }
        [left, right, ..] => (
            block_peak(&left[..frames.min(left.len())]),
            block_peak(&right[..frames.min(right.len())]),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_float_swap() {
        let value = AtomicFloat::new(1.0);
        assert_eq!(value.swap(2.0), 1.0);
        assert_eq!(value.get(), 2.0);
    }

    #[test]
    fn test_peaks_mono_feeds_both_sides() {
        let meters = PeakMeters::default();
        let input = vec![vec![0.1, -0.7, 0.3]];
        let output = vec![vec![0.2, 0.2, 0.2], vec![-0.9, 0.0, 0.0]];
        meters.update(&input, &output, 3);
        let [in_l, in_r, out_l, out_r] = meters.snapshot();
        assert!((in_l - 0.7).abs() < 1e-6);
        assert_eq!(in_l, in_r);
        assert!((out_l - 0.2).abs() < 1e-6);
        assert!((out_r - 0.9).abs() < 1e-6);

        meters.reset();
        assert_eq!(meters.snapshot(), [0.0; 4]);
    }
}
