//! Linear fade-out ramp
//!
//! Applied to encoder input independently of encoding and flushing. When the
//! ramp reaches silence it resets to unity gain; the stream is expected to
//! have been stopped by then.

#[derive(Debug, Clone)]
pub struct FadeRamp {
    gain: f32,
    step: f32,
    active: bool,
}

impl Default for FadeRamp {
    fn default() -> Self {
        Self {
            gain: 1.0,
            step: 0.0,
            active: false,
        }
    }
}

impl FadeRamp {
    /// Begin fading from the current gain to silence over `seconds`
    pub fn start(&mut self, sample_rate: u32, seconds: f32) {
        let total = (sample_rate as f32 * seconds).max(1.0);
        self.step = 1.0 / total;
        self.gain = 1.0;
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Scale planar frames in place, with `pregain` applied on top
    pub fn apply(&mut self, left: &mut [f32], right: &mut [f32], pregain: f32) {
        if !self.active {
            if (pregain - 1.0).abs() > f32::EPSILON {
                left.iter_mut().for_each(|s| *s *= pregain);
                right.iter_mut().for_each(|s| *s *= pregain);
            }
            return;
        }

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let g = self.gain * pregain;
            *l *= g;
            *r *= g;
            if self.active {
                self.gain -= self.step;
                if self.gain <= 0.0 {
                    self.gain = 1.0;
                    self.active = false;
                    tracing::debug!("Fade complete, gain reset to unity");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_applies_pregain_only() {
        let mut fade = FadeRamp::default();
        let mut l = vec![0.5; 4];
        let mut r = vec![0.5; 4];
        fade.apply(&mut l, &mut r, 2.0);
        assert!(l.iter().all(|&s| (s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_ramp_is_linear_and_resets() {
        let mut fade = FadeRamp::default();
        fade.start(10, 1.0);
        let mut l = vec![1.0; 10];
        let mut r = vec![1.0; 10];
        fade.apply(&mut l, &mut r, 1.0);

        assert!((l[0] - 1.0).abs() < 1e-6);
        assert!((l[5] - 0.5).abs() < 1e-5);
        for pair in l.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert!(!fade.is_active());
        assert_eq!(fade.gain(), 1.0);
    }
}
