// tuner.rs — Bounded stochastic tuner (simulated annealing over an integer).
//
// Used by the keypoint codec to pick the offset-search limit that makes
// downloads fastest on the running device. The tuner proposes a value, the
// caller measures something with it and feeds the cost back. Costs are
// noisy, so each candidate is measured `bucket_size` times and the mean is
// used.
//
//   candidate ← clamp(neighbour(state))
//   Δ = cost(candidate) - cost(state)
//   accept if Δ < 0, or with probability exp(-Δ / T)
//   T ← T · (1 - alpha) every `iterations_per_temperature` evaluations
//
// After `max_iterations` evaluations the tuner settles on the best value
// seen and ignores further observations until `reset`.
//
// NEW RUST CONCEPTS:
// - Blanket impl: any `FnMut(i32, &mut StdRng) -> i32` closure is a
//   `Neighbour`, so tests can plug in a deterministic strategy.
// - `Box<dyn Trait>` for the strategy, so `StochasticTuner` itself is not
//   generic.

use log::debug;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Proposes the next state to try from the current one.
pub trait Neighbour {
    fn propose(&mut self, state: i32, rng: &mut StdRng) -> i32;
}

impl<F> Neighbour for F
where
    F: FnMut(i32, &mut StdRng) -> i32,
{
    fn propose(&mut self, state: i32, rng: &mut StdRng) -> i32 {
        self(state, rng)
    }
}

/// Gaussian step around the current state, rounded to an integer.
#[derive(Debug, Clone, Copy)]
pub struct GaussianNeighbour {
    pub sigma: f64,
}

impl Neighbour for GaussianNeighbour {
    fn propose(&mut self, state: i32, rng: &mut StdRng) -> i32 {
        match Normal::new(0.0, self.sigma) {
            Ok(normal) => state + normal.sample(rng).round() as i32,
            Err(_) => state,
        }
    }
}

/// Tuner parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TunerConfig {
    pub initial: i32,
    pub min: i32,
    pub max: i32,
    /// Cooling rate per temperature step, in (0, 1).
    pub alpha: f64,
    pub iterations_per_temperature: usize,
    pub max_iterations: usize,
    pub initial_temperature: f64,
    /// Observations averaged per evaluation.
    pub bucket_size: usize,
    /// Standard deviation of the default Gaussian neighbour.
    pub sigma: f64,
    /// Fixed RNG seed. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for TunerConfig {
    fn default() -> Self {
        TunerConfig {
            initial: 48,
            min: 32,
            max: 48,
            alpha: 0.2,
            iterations_per_temperature: 8,
            max_iterations: 60,
            initial_temperature: 16.0,
            bucket_size: 4,
            sigma: 4.0,
            seed: None,
        }
    }
}

/// Simulated-annealing tuner over a bounded integer.
pub struct StochasticTuner {
    config: TunerConfig,
    neighbour: Box<dyn Neighbour + Send>,
    rng: StdRng,
    /// Accepted state and its cost (None until first evaluated).
    state: i32,
    energy: Option<f64>,
    /// Value currently being measured.
    candidate: i32,
    best: (i32, f64),
    temperature: f64,
    bucket: Vec<f64>,
    iteration: usize,
}

impl StochasticTuner {
    /// Tuner with the default Gaussian neighbour.
    pub fn new(config: TunerConfig) -> Self {
        let neighbour = GaussianNeighbour {
            sigma: config.sigma,
        };
        Self::with_neighbour(config, neighbour)
    }

    /// # Panics
    /// Panics if `min > max` or `bucket_size == 0`.
    pub fn with_neighbour(config: TunerConfig, neighbour: impl Neighbour + Send + 'static) -> Self {
        assert!(config.min <= config.max, "tuner bounds [{}, {}] are empty", config.min, config.max);
        assert!(config.bucket_size > 0, "tuner bucket size must be positive");
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let initial = config.initial.clamp(config.min, config.max);
        StochasticTuner {
            neighbour: Box::new(neighbour),
            rng,
            state: initial,
            energy: None,
            candidate: initial,
            best: (initial, f64::INFINITY),
            temperature: config.initial_temperature,
            bucket: Vec::with_capacity(config.bucket_size),
            iteration: 0,
            config,
        }
    }

    /// The value the caller should use now. Always within bounds.
    pub fn current_value(&self) -> i32 {
        if self.finished() {
            self.best.0
        } else {
            self.candidate
        }
    }

    pub fn finished(&self) -> bool {
        self.iteration >= self.config.max_iterations
    }

    /// Completed evaluations since the last reset.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Best (value, mean cost) seen so far.
    pub fn best(&self) -> (i32, f64) {
        self.best
    }

    /// Back to the initial state and schedule. The RNG is not reseeded.
    pub fn reset(&mut self) {
        debug!("tuner: reset after {} iterations", self.iteration);
        let initial = self.config.initial.clamp(self.config.min, self.config.max);
        self.state = initial;
        self.energy = None;
        self.candidate = initial;
        self.best = (initial, f64::INFINITY);
        self.temperature = self.config.initial_temperature;
        self.bucket.clear();
        self.iteration = 0;
    }

    /// Report the cost of running with `current_value()`. Lower is better.
    /// Non-finite costs are ignored.
    pub fn feed_observation(&mut self, cost: f64) {
        if self.finished() || !cost.is_finite() {
            return;
        }
        self.bucket.push(cost);
        if self.bucket.len() < self.config.bucket_size {
            return;
        }
        let mean = self.bucket.iter().sum::<f64>() / self.bucket.len() as f64;
        self.bucket.clear();
        self.evaluate(mean);
    }

    fn evaluate(&mut self, cost: f64) {
        let accept = match self.energy {
            None => true,
            Some(energy) => {
                let delta = cost - energy;
                delta < 0.0 || self.rng.gen::<f64>() < (-delta / self.temperature.max(1e-9)).exp()
            }
        };
        if accept {
            self.state = self.candidate;
            self.energy = Some(cost);
        }
        if cost < self.best.1 {
            self.best = (self.candidate, cost);
        }

        self.iteration += 1;
        if self.iteration % self.config.iterations_per_temperature.max(1) == 0 {
            self.temperature *= 1.0 - self.config.alpha;
        }
        if self.finished() {
            debug!("tuner: settled on {} (cost {:.3})", self.best.0, self.best.1);
            return;
        }
        let proposal = self.neighbour.propose(self.state, &mut self.rng);
        self.candidate = proposal.clamp(self.config.min, self.config.max);
    }
}
