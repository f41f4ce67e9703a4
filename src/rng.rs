use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Seeded random source threaded through every stochastic draw of a run.
///
/// Noise vectors, reparameterization epsilons and caption choices all come from
/// here, so two runs built with the same seed replay the same draws.
#[derive(Clone, Debug)]
pub struct RandomContext {
    rng: StdRng,
}

impl RandomContext {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw a tensor of independent standard-normal values.
    pub fn standard_normal<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        device: &B::Device,
    ) -> Tensor<B, D> {
        let count = shape.iter().product::<usize>();
        let values: Vec<f32> = (0..count)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }

    /// Pick `amount` distinct indices from `0..upper` (fewer if `upper` is smaller).
    pub fn distinct_indices(&mut self, upper: usize, amount: usize) -> Vec<usize> {
        index::sample(&mut self.rng, upper, amount.min(upper)).into_vec()
    }
}
