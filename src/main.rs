use std::env;

use anyhow::{Context, Result};
use cfl::{
    data::Dataset,
    oracle::SoftmaxRegression,
    ComputeTarget, Federation, FederationConfig,
};
use env_logger::Env;
use log::info;
use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tokio::signal;

const CLIENTS: usize = 10;
const SAMPLES: usize = 200;
const FEATURES: usize = 8;
const CLASSES: usize = 4;

/// Builds the private dataset of a client.
///
/// Every client samples from the same class centers, odd clients see the labels shifted
/// by one so the roster holds two groups that disagree on the task.
fn synthetic(centers: &Array2<f32>, client: usize, seed: u64) -> cfl::Result<Dataset> {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1000 + client as u64));
    let noise = Normal::new(0., 1.).map_err(|e| cfl::CflErr::InvalidConfig(e.to_string()))?;

    let labels: Vec<usize> = (0..SAMPLES).map(|_| rng.random_range(0..CLASSES)).collect();
    let x = Array2::from_shape_fn((SAMPLES, FEATURES), |(i, j)| {
        centers[[labels[i], j]] + noise.sample(&mut rng)
    });

    let shift = client % 2;
    let labels: Vec<usize> = labels.iter().map(|l| (l + shift) % CLASSES).collect();
    Dataset::from_labels(x, &labels, CLASSES)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = match env::args().nth(1) {
        Some(path) => FederationConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {path}"))?,
        None => FederationConfig::default(),
    };

    let mut rng = StdRng::seed_from_u64(config.seed);
    let spread = Normal::new(0., 3.).context("building the class center distribution")?;
    let centers = Array2::from_shape_simple_fn((CLASSES, FEATURES), || spread.sample(&mut rng));

    let batch_size = config.batch_size;
    let oracle = move |target: ComputeTarget| {
        SoftmaxRegression::new(FEATURES, CLASSES, batch_size, target)
    };

    let init = oracle(config.target_for(0))
        .init_params(&mut rng)
        .context("initializing the model")?;

    let seed = config.seed;
    let provider = |client| synthetic(&centers, client, seed);
    let mut federation = Federation::new(config, init, CLIENTS, provider, oracle)?;

    info!("running {} rounds", federation.config().rounds);

    let rounds = federation.config().rounds;
    for _ in 0..rounds {
        let summary = tokio::select! {
            summary = federation.run_round() => summary?,
            _ = signal::ctrl_c() => {
                info!("received SIGTERM");
                break;
            }
        };

        println!("{}", serde_json::to_string(&summary)?);
    }

    for cohort in federation.cohorts() {
        let accuracy: f32 = cohort.iter().map(|&i| federation.accuracies()[i]).sum::<f32>()
            / cohort.len() as f32;
        info!("cohort {cohort:?} reached a mean accuracy of {accuracy:.3}");
    }

    Ok(())
}
