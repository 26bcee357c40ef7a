//! Maps the img2img `strength` onto the DDIM inference timesteps.
//!
//! The source latent is noised up to the timestep at `start_index` and only
//! the remaining `t_enc` steps are denoised. A strength of 1 starts from
//! (almost) pure noise, a strength of 0 runs no step at all.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrengthSchedule {
    n_steps: usize,
    t_enc: usize,
}

impl StrengthSchedule {
    pub fn new(strength: f64, n_steps: usize) -> Self {
        let t_enc = ((strength * n_steps as f64) as usize).min(n_steps);
        Self { n_steps, t_enc }
    }

    /// Number of denoising steps that will actually run.
    pub fn t_enc(&self) -> usize {
        self.t_enc
    }

    /// Index of the first inference timestep to run.
    pub fn start_index(&self) -> usize {
        self.n_steps - self.t_enc
    }

    pub fn is_identity(&self) -> bool {
        self.t_enc == 0
    }

    /// The timestep the source latent gets noised to, none when no step runs.
    pub fn noise_timestep(&self, timesteps: &[usize]) -> Option<usize> {
        if self.is_identity() {
            None
        } else {
            timesteps.get(self.start_index()).copied()
        }
    }

    /// The (index, timestep) pairs left to denoise.
    pub fn remaining<'a>(
        &self,
        timesteps: &'a [usize],
    ) -> impl Iterator<Item = (usize, usize)> + 'a {
        let start = self.start_index();
        timesteps.iter().copied().enumerate().skip(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // DDIM timesteps for 10 steps over 1000 training steps with an offset of 1.
    fn timesteps() -> Vec<usize> {
        (0..10).map(|s| s * 100 + 1).rev().collect()
    }

    #[test]
    fn default_strength() {
        let s = StrengthSchedule::new(0.75, 50);
        assert_eq!(s.t_enc(), 37);
        assert_eq!(s.start_index(), 13);
    }

    #[test]
    fn partial_noise() {
        let ts = timesteps();
        let s = StrengthSchedule::new(0.5, 10);
        assert_eq!(s.noise_timestep(&ts), Some(401));
        let run: Vec<_> = s.remaining(&ts).collect();
        assert_eq!(run.len(), 5);
        assert_eq!(run[0], (5, 401));
        assert_eq!(run[4], (9, 1));
    }

    #[test]
    fn full_strength_runs_every_step() {
        let ts = timesteps();
        let s = StrengthSchedule::new(1.0, 10);
        assert_eq!(s.start_index(), 0);
        assert_eq!(s.noise_timestep(&ts), Some(901));
        assert_eq!(s.remaining(&ts).count(), 10);
    }

    #[test]
    fn zero_strength_is_identity() {
        let ts = timesteps();
        let s = StrengthSchedule::new(0.0, 10);
        assert!(s.is_identity());
        assert_eq!(s.noise_timestep(&ts), None);
        assert_eq!(s.remaining(&ts).count(), 0);
    }
}
