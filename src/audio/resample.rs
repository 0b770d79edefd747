//! Streaming sample rate conversion using rubato
//!
//! Accepts arbitrary-length planar input and emits fixed-size output chunks
//! sized to the codec frame. [`StreamResampler::drain`] flushes the tail
//! without truncating it.

use rubato::{FftFixedOut, Resampler};

use crate::error::AudioError;

/// Resampling quality presets, selected by the `resample_quality` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleQuality {
    Fast,
    #[default]
    Medium,
    High,
    Best,
}

impl ResampleQuality {
    /// Parse the control protocol names `lowest`, `medium`, `high`, `highest`
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "lowest" | "fast" => Some(ResampleQuality::Fast),
            "medium" => Some(ResampleQuality::Medium),
            "high" => Some(ResampleQuality::High),
            "highest" | "best" => Some(ResampleQuality::Best),
            _ => None,
        }
    }

    fn sub_chunks(&self) -> usize {
        match self {
            ResampleQuality::Fast => 1,
            ResampleQuality::Medium => 2,
            ResampleQuality::High => 4,
            ResampleQuality::Best => 8,
        }
    }
}

pub struct StreamResampler {
    resampler: FftFixedOut<f32>,
    pending: [Vec<f32>; 2],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
}

impl StreamResampler {
    pub fn new(
        from_rate: u32,
        to_rate: u32,
        chunk_out: usize,
        channels: usize,
        quality: ResampleQuality,
    ) -> Result<Self, AudioError> {
        let channels = channels.clamp(1, 2);
        let resampler = FftFixedOut::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            chunk_out.max(64),
            quality.sub_chunks(),
            channels,
        )?;
        Ok(Self {
            resampler,
            pending: [Vec::new(), Vec::new()],
            channels,
            from_rate,
            to_rate,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.to_rate as f64 / self.from_rate as f64
    }

    /// Queue planar input. For mono only `left` is used.
    pub fn push(&mut self, left: &[f32], right: &[f32]) {
        self.pending[0].extend_from_slice(left);
        if self.channels == 2 {
            self.pending[1].extend_from_slice(right);
        }
    }

    /// Convert every whole chunk currently possible, appending to `out`
    pub fn process(&mut self, out: &mut [Vec<f32>; 2]) -> Result<usize, AudioError> {
        let mut produced = 0;
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let input: Vec<&[f32]> = self.pending[..self.channels]
                .iter()
                .map(|ch| &ch[..needed])
                .collect();
            let output = self.resampler.process(&input, None)?;
            produced += Self::append(out, &output);
            for ch in self.pending[..self.channels].iter_mut() {
                ch.drain(..needed);
            }
        }
        Ok(produced)
    }

    /// Flush remaining input plus the filter delay line
    pub fn drain(&mut self, out: &mut [Vec<f32>; 2]) -> Result<usize, AudioError> {
        let mut produced = self.process(out)?;
        if !self.pending[0].is_empty() {
            let input: Vec<&[f32]> = self.pending[..self.channels]
                .iter()
                .map(|ch| ch.as_slice())
                .collect();
            let output = self.resampler.process_partial(Some(input.as_slice()), None)?;
            produced += Self::append(out, &output);
            for ch in self.pending.iter_mut() {
                ch.clear();
            }
        }
        let tail = self.resampler.process_partial::<&[f32]>(None, None)?;
        produced += Self::append(out, &tail);
        self.resampler.reset();
        Ok(produced)
    }

    fn append(out: &mut [Vec<f32>; 2], chunk: &[Vec<f32>]) -> usize {
        let frames = chunk.first().map_or(0, Vec::len);
        out[0].extend_from_slice(&chunk[0]);
        match chunk.get(1) {
            Some(right) => out[1].extend_from_slice(right),
            None => out[1].extend_from_slice(&chunk[0]),
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_output_chunks() {
        let mut rs = StreamResampler::new(44100, 48000, 960, 2, ResampleQuality::Fast).unwrap();
        let mut out = [Vec::new(), Vec::new()];
        rs.push(&vec![0.0; 44100], &vec![0.0; 44100]);
        let produced = rs.process(&mut out).unwrap();
        assert_eq!(produced % 960, 0);
        assert_eq!(out[0].len(), out[1].len());
        assert!(produced >= 48000 - 2 * 960);
    }

    #[test]
    fn test_drain_keeps_tail() {
        let mut rs = StreamResampler::new(44100, 48000, 960, 2, ResampleQuality::Fast).unwrap();
        let mut out = [Vec::new(), Vec::new()];
        rs.push(&vec![0.1; 500], &vec![0.1; 500]);
        assert_eq!(rs.process(&mut out).unwrap(), 0);
        let drained = rs.drain(&mut out).unwrap();
        assert!(drained >= 500);
    }
}
