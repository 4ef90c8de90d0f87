//! Parallel trajectory ensembles.
//!
//! A single trajectory is strictly sequential, but independent trajectories
//! are embarrassingly parallel: each rayon task builds its own simulation
//! from the supplied constructor, seeded `seed + index`, and runs it to the
//! requested time.

use rayon::prelude::*;

use crate::error::SimError;
use crate::output::SampleRow;
use crate::system::Simulation;

/// Summary of one finished trajectory.
#[derive(Clone, Debug)]
pub struct Trajectory {
    pub seed: u64,
    pub final_time: f64,
    pub events: u64,
    pub null_events: u64,
    pub samples: Vec<SampleRow>,
}

impl Trajectory {
    /// Final sampled value of one output column.
    pub fn final_value(&self, column: usize) -> Option<f64> {
        self.samples
            .last()
            .and_then(|row| row.values.get(column))
            .copied()
    }
}

/// Simulate `n_trajectories` independent replicas in parallel.
///
/// `build` constructs a fresh model for a given seed; preparation is run
/// automatically if the constructor left it out.
pub fn run_trajectories<F>(
    n_trajectories: usize,
    seed: u64,
    duration: f64,
    samples: u64,
    build: F,
) -> Result<Vec<Trajectory>, SimError>
where
    F: Fn(u64) -> Result<Simulation, SimError> + Sync,
{
    (0..n_trajectories)
        .into_par_iter()
        .map(|i| {
            let traj_seed = seed.wrapping_add(i as u64);
            let mut sim = build(traj_seed)?;
            if !sim.is_prepared() {
                sim.prepare_for_simulation()?;
            }
            let final_time = sim.sim(duration, samples, false)?;
            Ok(Trajectory {
                seed: traj_seed,
                final_time,
                events: sim.event_count(),
                null_events: sim.null_event_count(),
                samples: sim.trace().to_vec(),
            })
        })
        .collect()
}

/// Mean final value of one output column across an ensemble.
pub fn ensemble_mean(trajectories: &[Trajectory], column: usize) -> f64 {
    if trajectories.is_empty() {
        return 0.0;
    }
    let sum: f64 = trajectories
        .iter()
        .filter_map(|t| t.final_value(column))
        .sum();
    sum / trajectories.len() as f64
}
