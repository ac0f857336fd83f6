use rand::Rng;

/// Source of uniform draws for response generation.
pub trait RandomSource: Send + Sync {
    /// Uniform integer in `[0, upper)`. `upper` is always > 0.
    fn below(&self, upper: usize) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn below(&self, upper: usize) -> usize {
        rand::thread_rng().gen_range(0..upper)
    }
}
