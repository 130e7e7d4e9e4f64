use std::{mem, sync::Arc};

use log::{debug, info, warn};
use parking_lot::MutexGuard;
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    client::Client,
    cohorts,
    config::{ComputeTarget, DeltaPolicy, FederationConfig, Strategy},
    data::DatasetProvider,
    device::Device,
    error::{CflErr, Result},
    execution::{LocalRound, RoundExecutor, RoundOutcome},
    oracle::TrainingOracle,
    params::ParameterMap,
    server::{Server, SharedClient},
};

/// Divergence of a cohort's participants during a round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortStats {
    pub members: Vec<usize>,
    pub participants: usize,
    pub mean_norm: f32,
    pub max_norm: f32,
}

/// Everything that happened in a single round, serializable for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundSummary {
    pub round: usize,
    pub participants: Vec<usize>,
    pub failed: Vec<usize>,
    pub timed_out: Vec<usize>,
    pub busy: Vec<usize>,
    pub mean_loss: Option<f32>,
    pub stats: Vec<CohortStats>,
    /// The cohorts that were split this round, as they were before the split.
    pub splits: Vec<Vec<usize>>,
    /// The cohorts at the end of the round.
    pub cohorts: Vec<Vec<usize>>,
    /// The last known accuracy of every client, indexed by roster position.
    pub accuracies: Vec<f32>,
    pub mean_accuracy: f32,
}

/// Drives a federation round by round.
///
/// With the clustered strategy clients start as a single cohort that keeps being split
/// in two once its members stop agreeing on a common update. With federated averaging
/// there is a single global model.
pub struct Federation<O: TrainingOracle> {
    config: FederationConfig,
    server: Server<O>,
    executor: RoundExecutor,
    rng: StdRng,
    cohorts: Vec<Vec<usize>>,
    accuracies: Vec<f32>,
    round: usize,
}

impl<O: TrainingOracle + 'static> Federation<O> {
    /// Creates a new `Federation`.
    ///
    /// The server takes the first compute target and clients the following ones, every
    /// device starts from a copy of `init`.
    ///
    /// # Arguments
    /// * `config` - The federation settings.
    /// * `init` - The initial model parameters.
    /// * `clients` - The amount of clients in the roster.
    /// * `provider` - Supplies each client's private data.
    /// * `oracle` - Builds a training oracle for a compute target.
    ///
    /// # Returns
    /// An error if the config is invalid, there are no clients or a dataset can't be built.
    pub fn new<P, F>(
        config: FederationConfig,
        init: ParameterMap,
        clients: usize,
        mut provider: P,
        mut oracle: F,
    ) -> Result<Self>
    where
        P: DatasetProvider,
        F: FnMut(ComputeTarget) -> O,
    {
        config.validate()?;

        if clients == 0 {
            return Err(CflErr::InsufficientMembers {
                op: "federation",
                got: 0,
                required: 1,
            });
        }

        let roster = (0..clients)
            .map(|id| {
                let target = config.target_for(id + 1);
                let device = Device::new(init.clone(), oracle(target), target);
                Client::new(id, device, provider.provide(id)?, &config)
            })
            .collect::<Result<Vec<_>>>()?;

        let target = config.target_for(0);
        let server = Server::new(Device::new(init, oracle(target), target), roster);

        info!(clients = clients, strategy:? = config.strategy; "federation ready");

        Ok(Self {
            executor: RoundExecutor::new(config.parallelism.get(), config.client_timeout()),
            rng: StdRng::seed_from_u64(config.seed),
            cohorts: vec![(0..clients).collect()],
            accuracies: vec![0.; clients],
            round: 0,
            server,
            config,
        })
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn server(&self) -> &Server<O> {
        &self.server
    }

    /// The current cohorts, each sorted and ordered by their lowest member.
    pub fn cohorts(&self) -> &[Vec<usize>] {
        &self.cohorts
    }

    pub fn accuracies(&self) -> &[f32] {
        &self.accuracies
    }

    /// The amount of rounds run so far.
    pub fn round(&self) -> usize {
        self.round
    }

    /// Runs every configured round.
    pub async fn run(&mut self) -> Result<Vec<RoundSummary>> {
        let mut summaries = Vec::with_capacity(self.config.rounds);
        for _ in 0..self.config.rounds {
            summaries.push(self.run_round().await?);
        }

        Ok(summaries)
    }

    /// Runs a single round: local training, aggregation and evaluation.
    ///
    /// # Returns
    /// The round's summary, or the first error that can't be handled by dropping a client.
    pub async fn run_round(&mut self) -> Result<RoundSummary> {
        self.round += 1;
        let round = self.round;

        if round == 1 {
            let global = self.server.params().clone();
            for shared in self.server.roster() {
                shared.lock().synchronize_with(&global)?;
            }
        }

        let selected = self
            .server
            .select_clients(self.config.participation, &mut self.rng);

        let sync = match self.config.strategy {
            Strategy::FedAvg => Some(self.server.params().clone()),
            Strategy::Clustered => None,
        };

        let work = LocalRound {
            sync,
            clear_delta: self.config.delta_policy == DeltaPolicy::PerRound,
            epochs: self.config.local_epochs,
        };

        let clients = selected
            .iter()
            .map(|&id| (id, Arc::clone(&self.server.roster()[id])))
            .collect();

        let outcome = self.executor.execute(clients, work).await;
        let participants = outcome.participants();

        let (stats, splits) = match self.config.strategy {
            Strategy::FedAvg => self.aggregate_global(&participants)?,
            Strategy::Clustered => self.aggregate_cohorts(&participants)?,
        };

        self.evaluate_clients();
        let summary = self.summarize(outcome, stats, splits);

        info!(
            round = round,
            participants = summary.participants.len(),
            cohorts = summary.cohorts.len(),
            mean_accuracy = summary.mean_accuracy;
            "round finished"
        );

        Ok(summary)
    }

    fn aggregate_global(&mut self, participants: &[usize]) -> Result<(Vec<CohortStats>, Vec<Vec<usize>>)> {
        let shared = self.shared(participants);
        let mut stats = Vec::new();

        {
            let guards: Vec<_> = shared.iter().map(|c| c.lock()).collect();
            let refs: Vec<&Client<O>> = guards.iter().map(|g| &**g).collect();

            if !refs.is_empty() {
                stats.push(self.cohort_stats(&self.cohorts[0], &refs)?);
                self.server.aggregate_global(&refs)?;
            }
        }

        let global = self.server.params().clone();
        for shared in self.server.roster() {
            match shared.try_lock() {
                Some(mut client) => client.synchronize_with(&global)?,
                None => debug!("skipped synchronizing a busy client"),
            }
        }

        Ok((stats, Vec::new()))
    }

    fn aggregate_cohorts(&mut self, participants: &[usize]) -> Result<(Vec<CohortStats>, Vec<Vec<usize>>)> {
        let shared = self.shared(participants);
        let mut guards: Vec<MutexGuard<'_, Client<O>>> = shared.iter().map(|c| c.lock()).collect();

        let mut stats = Vec::new();
        let mut splits = Vec::new();
        let mut next = Vec::with_capacity(self.cohorts.len() + 1);

        {
            let refs: Vec<&Client<O>> = guards.iter().map(|g| &**g).collect();
            let similarity = if refs.is_empty() {
                None
            } else {
                Some(self.server.compute_pairwise_similarities(&refs)?)
            };

            for cohort in mem::take(&mut self.cohorts) {
                let positions: Vec<usize> = cohort
                    .iter()
                    .filter_map(|id| participants.binary_search(id).ok())
                    .collect();

                let (Some(similarity), false) = (&similarity, positions.is_empty()) else {
                    next.push(cohort);
                    continue;
                };

                let members: Vec<&Client<O>> = positions.iter().map(|&p| refs[p]).collect();
                let cohort_stats = self.cohort_stats(&cohort, &members)?;

                if !self.should_split(&cohort_stats) {
                    stats.push(cohort_stats);
                    next.push(cohort);
                    continue;
                }

                self.server
                    .cache_snapshot(&cohort, members[0].params(), &self.accuracies)?;

                let sub = cohorts::restrict(similarity, &positions)?;
                let (first, second) = self.server.split_cluster(&sub)?.remap(&cohort)?.into_parts();

                info!(
                    round = self.round,
                    mean_norm = cohort_stats.mean_norm,
                    max_norm = cohort_stats.max_norm;
                    "split cohort {cohort:?} into {first:?} and {second:?}"
                );

                stats.push(cohort_stats);
                splits.push(cohort);
                next.push(first);
                next.push(second);
            }
        }

        self.cohorts = next;

        let mut cohort_of = vec![None; self.accuracies.len()];
        for (i, cohort) in self.cohorts.iter().enumerate() {
            for &id in cohort {
                cohort_of[id] = Some(i);
            }
        }

        let mut groups: Vec<Vec<&mut Client<O>>> = self.cohorts.iter().map(|_| Vec::new()).collect();
        for guard in guards.iter_mut() {
            if let Some(i) = cohort_of[guard.id()] {
                groups[i].push(&mut **guard);
            }
        }
        groups.retain(|g| !g.is_empty());

        self.server.aggregate_clusterwise(&mut groups)?;
        for client in groups.iter_mut().flatten() {
            client.commit_sync()?;
        }

        Ok((stats, splits))
    }

    /// Measures every client on its own evaluation set, busy clients keep their last value.
    fn evaluate_clients(&mut self) {
        let measured: Vec<Option<f32>> = self
            .server
            .roster()
            .par_iter()
            .map(|shared| {
                let mut client = shared.try_lock()?;
                client
                    .evaluate()
                    .inspect_err(|e| warn!("evaluation skipped: {e}"))
                    .ok()
            })
            .collect();

        for (acc, m) in self.accuracies.iter_mut().zip(measured) {
            if let Some(m) = m {
                *acc = m;
            }
        }
    }

    fn cohort_stats(&self, cohort: &[usize], members: &[&Client<O>]) -> Result<CohortStats> {
        Ok(CohortStats {
            members: cohort.to_vec(),
            participants: members.len(),
            mean_norm: self.server.mean_update_norm(members)?,
            max_norm: self.server.max_update_norm(members)?,
        })
    }

    /// A cohort splits once every member took part, it is past warmup and its members
    /// pull apart: their average update is small while some individual update is large.
    fn should_split(&self, stats: &CohortStats) -> bool {
        stats.participants == stats.members.len()
            && stats.members.len() >= self.config.min_split_size
            && self.round > self.config.warmup_rounds
            && stats.mean_norm < self.config.mean_norm_threshold
            && stats.max_norm > self.config.max_norm_threshold
    }

    fn shared(&self, ids: &[usize]) -> Vec<SharedClient<O>> {
        ids.iter()
            .map(|&id| Arc::clone(&self.server.roster()[id]))
            .collect()
    }

    fn summarize(&self, outcome: RoundOutcome, stats: Vec<CohortStats>, splits: Vec<Vec<usize>>) -> RoundSummary {
        let mean_loss = if outcome.completed.is_empty() {
            None
        } else {
            let total: f32 = outcome.completed.iter().map(|&(_, loss)| loss).sum();
            Some(total / outcome.completed.len() as f32)
        };

        let mean_accuracy = self.accuracies.iter().sum::<f32>() / self.accuracies.len() as f32;

        RoundSummary {
            round: self.round,
            participants: outcome.participants(),
            failed: outcome.failed,
            timed_out: outcome.timed_out,
            busy: outcome.busy,
            mean_loss,
            stats,
            splits,
            cohorts: self.cohorts.clone(),
            accuracies: self.accuracies.clone(),
            mean_accuracy,
        }
    }
}
