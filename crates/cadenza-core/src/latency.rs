//! Plugin latency buffers.
//!
//! Each buffer holds the last `frames` input samples of one channel so the dry
//! signal can be mixed back in alignment with a latent wet signal.

#[derive(Debug, Default, Clone)]
pub struct LatencyBuffers {
    frames: usize,
    buffers: Vec<Vec<f32>>,
}

impl LatencyBuffers {
    pub fn new(channels: usize, frames: usize) -> Self {
        let mut buffers = Self::default();
        buffers.recreate(channels, frames);
        buffers
    }

    /// Resize for a new channel count or latency. Contents are cleared.
    pub fn recreate(&mut self, channels: usize, frames: usize) {
        self.frames = frames;
        if frames == 0 {
            self.buffers.clear();
            return;
        }
        self.buffers = vec![vec![0.0; frames]; channels];
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&mut self) {
        for buffer in &mut self.buffers {
            buffer.fill(0.0);
        }
    }

    /// Dry sample `k` of the current block for `channel`, delayed by the latency.
    #[inline]
    pub fn dry_sample(&self, channel: usize, k: usize, input: &[f32]) -> f32 {
        if k < self.frames {
            if let Some(buffer) = self.buffers.get(channel) {
                return buffer[k];
            }
        }
        if self.frames < input.len() && k >= self.frames {
            input[k - self.frames]
        } else {
            input.get(k).copied().unwrap_or(0.0)
        }
    }

    /// Remember the tail of this block's input for the next block.
    pub fn store<S: AsRef<[f32]>>(&mut self, inputs: &[S], frames: usize) {
        let latency = self.frames;
        if latency == 0 {
            return;
        }

        for (buffer, input) in self.buffers.iter_mut().zip(inputs.iter()) {
            let input = input.as_ref();
            let input = &input[..frames.min(input.len())];
            if latency <= input.len() {
                buffer.copy_from_slice(&input[input.len() - latency..]);
            } else {
                let keep = latency - input.len();
                buffer.copy_within(input.len().., 0);
                buffer[keep..].copy_from_slice(input);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_latency_is_passthrough() {
        let buffers = LatencyBuffers::new(2, 0);
        let input = [0.1, 0.2, 0.3];
        assert_eq!(buffers.dry_sample(0, 1, &input), 0.2);
        assert_eq!(buffers.channels(), 0);
    }

    #[test]
    fn test_dry_signal_is_delayed() {
        let mut buffers = LatencyBuffers::new(1, 2);
        let block1 = vec![vec![1.0, 2.0, 3.0, 4.0]];
        let dry: Vec<f32> = (0..4).map(|k| buffers.dry_sample(0, k, &block1[0])).collect();
        assert_eq!(dry, vec![0.0, 0.0, 1.0, 2.0]);
        buffers.store(&block1, 4);

        let block2 = vec![vec![5.0, 6.0, 7.0, 8.0]];
        let dry: Vec<f32> = (0..4).map(|k| buffers.dry_sample(0, k, &block2[0])).collect();
        assert_eq!(dry, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_latency_longer_than_block() {
        let mut buffers = LatencyBuffers::new(1, 4);
        buffers.store(&[vec![1.0, 2.0]], 2);
        buffers.store(&[vec![3.0, 4.0]], 2);
        let input = [9.0, 9.0];
        assert_eq!(buffers.dry_sample(0, 0, &input), 1.0);
        assert_eq!(buffers.dry_sample(0, 1, &input), 2.0);
    }
}
