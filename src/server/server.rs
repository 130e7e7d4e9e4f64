use std::sync::Arc;

use log::{debug, info};
use ndarray::Array2;
use parking_lot::Mutex;
use rand::Rng;

use super::{select_clients, ModelCacheEntry};
use crate::{
    client::Client,
    cohorts::{self, ClusterAssignment},
    data::Dataset,
    device::Device,
    error::{CflErr, Result},
    oracle::TrainingOracle,
    params::{self, ParameterMap},
};

/// A roster member, locked by whichever worker is currently driving it.
pub type SharedClient<O> = Arc<Mutex<Client<O>>>;

/// The coordinator of the federation.
///
/// It owns the global model, the fixed roster of clients and the append-only history
/// of cached cohort models. The global parameters only change through aggregation.
pub struct Server<O: TrainingOracle> {
    device: Device<O>,
    roster: Vec<SharedClient<O>>,
    cache: Vec<ModelCacheEntry>,
}

impl<O: TrainingOracle> Server<O> {
    /// Creates a new `Server`.
    ///
    /// # Arguments
    /// * `device` - The global model and its oracle.
    /// * `clients` - Every member of the federation, their position becomes their id.
    pub fn new(device: Device<O>, clients: Vec<Client<O>>) -> Self {
        let roster = clients
            .into_iter()
            .map(|c| Arc::new(Mutex::new(c)))
            .collect();

        Self {
            device,
            roster,
            cache: Vec::new(),
        }
    }

    /// The global parameters.
    pub fn params(&self) -> &ParameterMap {
        self.device.params()
    }

    pub fn roster(&self) -> &[SharedClient<O>] {
        &self.roster
    }

    /// Every cohort snapshot cached so far, oldest first.
    pub fn cache(&self) -> &[ModelCacheEntry] {
        &self.cache
    }

    /// Samples the clients taking part in a round.
    ///
    /// # Arguments
    /// * `fraction` - The share of the roster to select.
    /// * `rng` - The injected random source.
    ///
    /// # Returns
    /// The selected roster positions, ascending.
    pub fn select_clients<R: Rng + ?Sized>(&self, fraction: f32, rng: &mut R) -> Vec<usize> {
        select_clients(self.roster.len(), fraction, rng)
    }

    /// Adds the mean delta of `clients` into the global parameters, one round of
    /// federated averaging.
    ///
    /// # Returns
    /// `EmptySourceSet` if `clients` is empty or a key/shape mismatch.
    pub fn aggregate_global(&mut self, clients: &[&Client<O>]) -> Result<()> {
        if clients.is_empty() {
            return Err(CflErr::EmptySourceSet {
                op: "aggregate_global",
            });
        }

        let deltas: Vec<&ParameterMap> = clients.iter().map(|c| c.delta()).collect();
        params::accumulate_mean(&mut [self.device.params_mut()], &deltas)?;

        info!("aggregated {} client updates into the global model", clients.len());
        Ok(())
    }

    /// Builds the pairwise cosine similarity matrix of the clients' deltas.
    pub fn compute_pairwise_similarities(&self, clients: &[&Client<O>]) -> Result<Array2<f32>> {
        let deltas: Vec<&ParameterMap> = clients.iter().map(|c| c.delta()).collect();
        cohorts::pairwise_cosine_similarity(&deltas)
    }

    /// Bipartitions the rows of `similarity` with complete-linkage clustering.
    pub fn split_cluster(&self, similarity: &Array2<f32>) -> Result<ClusterAssignment> {
        cohorts::split_cluster(similarity)
    }

    /// Adds the mean delta of every cohort into the parameters of each of its members.
    ///
    /// Members of a cohort move towards their own cohort average instead of the global
    /// one. Every cohort is validated before any member is written.
    ///
    /// # Arguments
    /// * `cohorts` - Disjoint groups of clients.
    ///
    /// # Returns
    /// `EmptySourceSet` if any cohort is empty or a key/shape mismatch.
    pub fn aggregate_clusterwise(&self, cohorts: &mut [Vec<&mut Client<O>>]) -> Result<()> {
        let mut means = Vec::with_capacity(cohorts.len());

        for cohort in cohorts.iter() {
            let deltas: Vec<&ParameterMap> = cohort.iter().map(|c| c.delta()).collect();
            if deltas.is_empty() {
                return Err(CflErr::EmptySourceSet {
                    op: "aggregate_clusterwise",
                });
            }

            let avg = params::mean(&deltas)?;
            for member in cohort {
                member.params().check_compatible(&avg)?;
            }

            means.push(avg);
        }

        for (cohort, avg) in cohorts.iter_mut().zip(&means) {
            for member in cohort.iter_mut() {
                member.params_mut().accumulate(avg)?;
            }

            debug!("aggregated cohort of {} clients", cohort.len());
        }

        Ok(())
    }

    /// Averages the deltas of `clients` into a standalone map, nothing is mutated.
    ///
    /// # Returns
    /// `EmptySourceSet` if `clients` is empty.
    pub fn average_delta(&self, clients: &[&Client<O>]) -> Result<ParameterMap> {
        let deltas: Vec<&ParameterMap> = clients.iter().map(|c| c.delta()).collect();
        params::mean(&deltas).map_err(|e| match e {
            CflErr::EmptySourceSet { .. } => CflErr::EmptySourceSet { op: "average_delta" },
            other => other,
        })
    }

    /// The largest euclidean norm among the clients' deltas.
    ///
    /// # Returns
    /// `EmptySourceSet` if `clients` is empty.
    pub fn max_update_norm(&self, clients: &[&Client<O>]) -> Result<f32> {
        clients
            .iter()
            .map(|c| c.delta().norm())
            .reduce(f32::max)
            .ok_or(CflErr::EmptySourceSet {
                op: "max_update_norm",
            })
    }

    /// The euclidean norm of the clients' mean delta.
    ///
    /// This is the norm of the mean, not the mean of the norms: clients pulling in
    /// opposite directions cancel out here while still showing in `max_update_norm`.
    ///
    /// # Returns
    /// `EmptySourceSet` if `clients` is empty.
    pub fn mean_update_norm(&self, clients: &[&Client<O>]) -> Result<f32> {
        Ok(self.average_delta(clients)?.norm())
    }

    /// Appends a frozen snapshot of `params` to the model cache.
    ///
    /// # Arguments
    /// * `indices` - The roster positions of the cohort.
    /// * `params` - The parameters to snapshot.
    /// * `accuracies` - Accuracy of every roster member, indexed by roster position.
    pub fn cache_snapshot(
        &mut self,
        indices: &[usize],
        params: &ParameterMap,
        accuracies: &[f32],
    ) -> Result<()> {
        let entry = ModelCacheEntry::new(indices, params, accuracies)?;
        self.cache.push(entry);
        debug!("cached model of cohort {indices:?}");
        Ok(())
    }

    /// Measures the accuracy of the global model on `data`.
    pub fn evaluate(&mut self, data: &Dataset) -> Result<f32> {
        self.device
            .evaluate(data)
            .map_err(|e| CflErr::OracleFailure {
                client: None,
                reason: e.0,
            })
    }
}
