use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{HarnessError, HarnessResult};
use crate::space::ParameterSpace;

/// The evaluation function handed to a strategy. An `Err` means the run must
/// stop (interrupt or setup failure), never that a simulation failed.
pub type Objective<'a> = dyn FnMut(&[f64]) -> HarnessResult<f64> + 'a;

/// Strategy-specific artifact persisted next to the trial log.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyReport {
    pub file_name: String,
    pub body: Value,
}

pub trait SearchStrategy {
    /// Short method name used in file names and the run manifest.
    fn method(&self) -> &'static str;

    /// Run-size tag for the output directory name.
    fn tag(&self) -> String;

    fn run(
        &mut self,
        space: &ParameterSpace,
        rng: &mut ChaCha8Rng,
        objective: &mut Objective<'_>,
    ) -> HarnessResult<Option<StrategyReport>>;
}

fn uniform_vector(space: &ParameterSpace, rng: &mut ChaCha8Rng) -> Vec<f64> {
    space
        .bounds()
        .iter()
        .map(|b| rng.gen_range(b.lo..=b.hi))
        .collect()
}

fn argmin(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold(0, |best, (i, v)| if *v < values[best] { i } else { best })
}

/// Evaluates a fixed list of vectors in order.
#[derive(Debug, Clone)]
pub struct Replay {
    pub vectors: Vec<Vec<f64>>,
}

impl Replay {
    pub fn new(vectors: Vec<Vec<f64>>) -> Self {
        Self { vectors }
    }
}

impl SearchStrategy for Replay {
    fn method(&self) -> &'static str {
        "replay"
    }

    fn tag(&self) -> String {
        "replay".to_string()
    }

    fn run(
        &mut self,
        space: &ParameterSpace,
        _rng: &mut ChaCha8Rng,
        objective: &mut Objective<'_>,
    ) -> HarnessResult<Option<StrategyReport>> {
        for vector in &self.vectors {
            space.check_dim(vector)?;
        }
        for (step, vector) in self.vectors.iter().enumerate() {
            debug!(step, "replay step");
            objective(vector)?;
        }
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct RandomSearch {
    pub n_iter: usize,
}

impl RandomSearch {
    pub fn new(n_iter: usize) -> Self {
        Self { n_iter }
    }
}

impl SearchStrategy for RandomSearch {
    fn method(&self) -> &'static str {
        "random"
    }

    fn tag(&self) -> String {
        self.n_iter.to_string()
    }

    fn run(
        &mut self,
        space: &ParameterSpace,
        rng: &mut ChaCha8Rng,
        objective: &mut Objective<'_>,
    ) -> HarnessResult<Option<StrategyReport>> {
        for step in 0..self.n_iter {
            debug!(step, "random step");
            let x = uniform_vector(space, rng);
            objective(&x)?;
        }
        Ok(None)
    }
}

/// Particle swarm: `w` inertia, `c1` personal memory, `c2` swarm memory.
#[derive(Debug, Clone)]
pub struct Pso {
    pub n_particles: usize,
    pub max_iter: usize,
    pub w: f64,
    pub c1: f64,
    pub c2: f64,
}

impl Pso {
    pub fn new(n_particles: usize, max_iter: usize) -> Self {
        Self {
            n_particles,
            max_iter,
            w: 0.8,
            c1: 0.5,
            c2: 0.5,
        }
    }
}

impl SearchStrategy for Pso {
    fn method(&self) -> &'static str {
        "pso"
    }

    fn tag(&self) -> String {
        format!("{}x{}", self.n_particles, self.max_iter)
    }

    fn run(
        &mut self,
        space: &ParameterSpace,
        rng: &mut ChaCha8Rng,
        objective: &mut Objective<'_>,
    ) -> HarnessResult<Option<StrategyReport>> {
        if self.n_particles == 0 {
            return Err(HarnessError::config("pso needs at least one particle"));
        }
        let n = self.n_particles;
        let lower = space.lower();
        let upper = space.upper();
        let dim = space.dim();

        let mut x: Vec<Vec<f64>> = (0..n).map(|_| uniform_vector(space, rng)).collect();
        let mut v: Vec<Vec<f64>> = (0..n)
            .map(|_| {
                (0..dim)
                    .map(|d| {
                        let span = upper[d] - lower[d];
                        rng.gen_range(-span..=span)
                    })
                    .collect()
            })
            .collect();
        let mut y = Vec::with_capacity(n);
        for particle in &x {
            y.push(objective(particle)?);
        }

        let mut pbest_x = x.clone();
        let mut pbest_y = y.clone();
        let g = argmin(&pbest_y);
        let mut gbest_x = pbest_x[g].clone();
        let mut gbest_y = pbest_y[g];
        let mut gbest_y_hist = Vec::with_capacity(self.max_iter);
        let mut record_x = Vec::with_capacity(self.max_iter);
        let mut record_v = Vec::with_capacity(self.max_iter);
        let mut record_y = Vec::with_capacity(self.max_iter);

        for iter in 0..self.max_iter {
            for i in 0..n {
                for d in 0..dim {
                    let r1: f64 = rng.gen();
                    let r2: f64 = rng.gen();
                    v[i][d] = self.w * v[i][d]
                        + self.c1 * r1 * (pbest_x[i][d] - x[i][d])
                        + self.c2 * r2 * (gbest_x[d] - x[i][d]);
                    x[i][d] = (x[i][d] + v[i][d]).max(lower[d]).min(upper[d]);
                }
            }
            for i in 0..n {
                y[i] = objective(&x[i])?;
                if y[i] < pbest_y[i] {
                    pbest_y[i] = y[i];
                    pbest_x[i] = x[i].clone();
                }
            }
            let g = argmin(&pbest_y);
            if pbest_y[g] < gbest_y {
                gbest_y = pbest_y[g];
                gbest_x = pbest_x[g].clone();
            }
            gbest_y_hist.push(gbest_y);
            record_x.push(x.clone());
            record_v.push(v.clone());
            record_y.push(y.clone());
            debug!(iter, gbest_y, "pso iteration");
        }

        info!(best_y = gbest_y, best_x = ?gbest_x, "pso finished");
        Ok(Some(StrategyReport {
            file_name: "pso_result.json".to_string(),
            body: json!({
                "best_x": gbest_x,
                "best_y": gbest_y,
                "gbest_y_hist": gbest_y_hist,
                "record_value": { "X": record_x, "V": record_v, "Y": record_y },
            }),
        }))
    }
}

/// Real-coded genetic algorithm: tournament selection, two-point crossover and
/// per-gene uniform resampling at `prob_mut`.
#[derive(Debug, Clone)]
pub struct Ga {
    pub n_population: usize,
    pub n_generation: usize,
    pub prob_mut: f64,
    pub tournament: usize,
}

impl Ga {
    pub fn new(n_population: usize, n_generation: usize) -> Self {
        Self {
            n_population,
            n_generation,
            prob_mut: 0.01,
            tournament: 3,
        }
    }

    fn select<'p>(&self, pop: &'p [Vec<f64>], fitness: &[f64], rng: &mut ChaCha8Rng) -> &'p [f64] {
        let mut best = rng.gen_range(0..pop.len());
        for _ in 1..self.tournament.max(1) {
            let challenger = rng.gen_range(0..pop.len());
            if fitness[challenger] < fitness[best] {
                best = challenger;
            }
        }
        &pop[best]
    }

    fn crossover(a: &[f64], b: &[f64], rng: &mut ChaCha8Rng) -> (Vec<f64>, Vec<f64>) {
        let dim = a.len();
        let (mut c1, mut c2) = (a.to_vec(), b.to_vec());
        if dim < 2 {
            return (c1, c2);
        }
        let mut p = rng.gen_range(0..dim);
        let mut q = rng.gen_range(0..dim);
        if p > q {
            std::mem::swap(&mut p, &mut q);
        }
        for d in p..=q {
            c1[d] = b[d];
            c2[d] = a[d];
        }
        (c1, c2)
    }

    fn mutate(&self, child: &mut [f64], space: &ParameterSpace, rng: &mut ChaCha8Rng) {
        for (gene, bound) in child.iter_mut().zip(space.bounds()) {
            if rng.gen::<f64>() < self.prob_mut {
                *gene = rng.gen_range(bound.lo..=bound.hi);
            }
        }
    }
}

impl SearchStrategy for Ga {
    fn method(&self) -> &'static str {
        "ga"
    }

    fn tag(&self) -> String {
        format!("{}x{}", self.n_population, self.n_generation)
    }

    fn run(
        &mut self,
        space: &ParameterSpace,
        rng: &mut ChaCha8Rng,
        objective: &mut Objective<'_>,
    ) -> HarnessResult<Option<StrategyReport>> {
        if self.n_population < 2 {
            return Err(HarnessError::config(format!(
                "ga needs a population of at least 2, got {}",
                self.n_population
            )));
        }
        let size = self.n_population;
        let mut pop: Vec<Vec<f64>> = (0..size).map(|_| uniform_vector(space, rng)).collect();
        let mut best_x: Vec<f64> = Vec::new();
        let mut best_y = f64::INFINITY;
        let mut generation_best_x = Vec::with_capacity(self.n_generation);
        let mut generation_best_y = Vec::with_capacity(self.n_generation);
        let mut all_history_y = Vec::with_capacity(self.n_generation);

        for generation in 0..self.n_generation {
            let mut fitness = Vec::with_capacity(size);
            for individual in &pop {
                fitness.push(objective(individual)?);
            }
            let g = argmin(&fitness);
            if fitness[g] < best_y {
                best_y = fitness[g];
                best_x = pop[g].clone();
            }
            generation_best_x.push(pop[g].clone());
            generation_best_y.push(fitness[g]);
            all_history_y.push(fitness.clone());
            debug!(generation, generation_best = fitness[g], "ga generation");

            let mut next = Vec::with_capacity(size);
            while next.len() < size {
                let a = self.select(&pop, &fitness, rng);
                let b = self.select(&pop, &fitness, rng);
                let (mut c1, mut c2) = Self::crossover(a, b, rng);
                self.mutate(&mut c1, space, rng);
                self.mutate(&mut c2, space, rng);
                next.push(c1);
                if next.len() < size {
                    next.push(c2);
                }
            }
            pop = next;
        }

        info!(best_y, best_x = ?best_x, "ga finished");
        Ok(Some(StrategyReport {
            file_name: "ga_result.json".to_string(),
            body: json!({
                "best_x": best_x,
                "best_y": if best_y.is_finite() { json!(best_y) } else { Value::Null },
                "generation_best_X": generation_best_x,
                "generation_best_Y": generation_best_y,
                "all_history_Y": all_history_y,
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParamBound;
    use rand::SeedableRng;

    fn space() -> ParameterSpace {
        ParameterSpace::new(vec![
            ParamBound::new("x", -5.0, 5.0),
            ParamBound::new("y", 0.0, 10.0),
        ])
        .expect("space")
    }

    fn sphere(v: &[f64]) -> f64 {
        (v[0] - 1.0).powi(2) + (v[1] - 2.0).powi(2)
    }

    #[test]
    fn replay_evaluates_literals_in_order() {
        let mut seen = Vec::new();
        let mut objective = |x: &[f64]| -> HarnessResult<f64> {
            seen.push(x.to_vec());
            Ok(0.0)
        };
        let mut replay = Replay::new(vec![vec![1.0, 2.0], vec![-3.0, 9.0]]);
        let report = replay
            .run(&space(), &mut ChaCha8Rng::seed_from_u64(0), &mut objective)
            .expect("replay");
        assert!(report.is_none());
        assert_eq!(seen, vec![vec![1.0, 2.0], vec![-3.0, 9.0]]);
    }

    #[test]
    fn replay_rejects_wrong_length_before_evaluating() {
        let mut calls = 0;
        let mut objective = |_: &[f64]| -> HarnessResult<f64> {
            calls += 1;
            Ok(0.0)
        };
        let mut replay = Replay::new(vec![vec![1.0, 2.0], vec![1.0]]);
        let err = replay
            .run(&space(), &mut ChaCha8Rng::seed_from_u64(0), &mut objective)
            .expect_err("bad literal");
        assert!(matches!(err, HarnessError::DimensionMismatch { .. }));
        assert_eq!(calls, 0);
    }

    #[test]
    fn random_search_draws_n_iter_in_bounds_and_is_seeded() {
        let s = space();
        let draw = |seed: u64| {
            let mut seen = Vec::new();
            let mut objective = |x: &[f64]| -> HarnessResult<f64> {
                seen.push(x.to_vec());
                Ok(0.0)
            };
            RandomSearch::new(3)
                .run(&s, &mut ChaCha8Rng::seed_from_u64(seed), &mut objective)
                .expect("random");
            seen
        };
        let first = draw(7);
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|x| s.contains(x)));
        assert_eq!(first, draw(7));
        assert_ne!(first, draw(8));
    }

    #[test]
    fn pso_tracks_monotone_best_on_sphere() {
        let s = space();
        let mut calls = 0;
        let mut objective = |x: &[f64]| -> HarnessResult<f64> {
            calls += 1;
            assert!(s.contains(x));
            Ok(sphere(x))
        };
        let report = Pso::new(8, 15)
            .run(&s, &mut ChaCha8Rng::seed_from_u64(1), &mut objective)
            .expect("pso")
            .expect("report");
        assert_eq!(calls, 8 * 16);
        assert_eq!(report.file_name, "pso_result.json");
        let hist = report.body["gbest_y_hist"].as_array().expect("hist");
        assert_eq!(hist.len(), 15);
        let values: Vec<f64> = hist.iter().map(|v| v.as_f64().expect("f64")).collect();
        assert!(values.windows(2).all(|w| w[1] <= w[0]));
        let best = report.body["best_y"].as_f64().expect("best");
        assert_eq!(Some(&best), values.last());
        assert!(best < 5.0, "{}", best);
        assert_eq!(report.body["record_value"]["X"].as_array().expect("X").len(), 15);
    }

    #[test]
    fn ga_keeps_population_in_bounds_and_tracks_best() {
        let s = space();
        let mut calls = 0;
        let mut objective = |x: &[f64]| -> HarnessResult<f64> {
            calls += 1;
            assert!(s.contains(x));
            Ok(sphere(x))
        };
        let report = Ga::new(10, 6)
            .run(&s, &mut ChaCha8Rng::seed_from_u64(3), &mut objective)
            .expect("ga")
            .expect("report");
        assert_eq!(calls, 60);
        let per_gen = report.body["generation_best_Y"].as_array().expect("gen");
        assert_eq!(per_gen.len(), 6);
        let best = report.body["best_y"].as_f64().expect("best");
        assert!(per_gen.iter().all(|v| v.as_f64().expect("f64") >= best));
    }

    #[test]
    fn widest_accepted_space_samples_without_panicking() {
        let s = ParameterSpace::new(vec![ParamBound::new("v", -1.0e300, 1.0e300)])
            .expect("space");
        let mut objective = |x: &[f64]| -> HarnessResult<f64> {
            assert!(x[0].is_finite());
            Ok(x[0].abs())
        };
        RandomSearch::new(3)
            .run(&s, &mut ChaCha8Rng::seed_from_u64(0), &mut objective)
            .expect("random");
        Pso::new(2, 2)
            .run(&s, &mut ChaCha8Rng::seed_from_u64(0), &mut objective)
            .expect("pso");
    }

    #[test]
    fn undersized_populations_are_rejected_before_evaluating() {
        let mut calls = 0;
        let mut objective = |_: &[f64]| -> HarnessResult<f64> {
            calls += 1;
            Ok(0.0)
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let ga = Ga::new(1, 3).run(&space(), &mut rng, &mut objective);
        assert!(matches!(ga, Err(HarnessError::Config(_))));
        let pso = Pso::new(0, 3).run(&space(), &mut rng, &mut objective);
        assert!(matches!(pso, Err(HarnessError::Config(_))));
        assert_eq!(calls, 0);
    }

    #[test]
    fn ga_with_odd_population_evaluates_exactly_population_times_generations() {
        let mut calls = 0;
        let mut objective = |x: &[f64]| -> HarnessResult<f64> {
            calls += 1;
            Ok(sphere(x))
        };
        Ga::new(3, 4)
            .run(&space(), &mut ChaCha8Rng::seed_from_u64(5), &mut objective)
            .expect("ga");
        assert_eq!(calls, 12);
    }

    #[test]
    fn objective_errors_stop_the_strategy() {
        let mut calls = 0;
        let mut objective = |_: &[f64]| -> HarnessResult<f64> {
            calls += 1;
            if calls == 2 {
                return Err(HarnessError::Interrupted);
            }
            Ok(1.0)
        };
        let err = RandomSearch::new(10)
            .run(&space(), &mut ChaCha8Rng::seed_from_u64(0), &mut objective)
            .expect_err("interrupted");
        assert!(matches!(err, HarnessError::Interrupted));
        assert_eq!(calls, 2);
    }
}
