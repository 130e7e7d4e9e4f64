use log::{debug, warn};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::FederationConfig,
    data::{DataSplit, Dataset},
    device::Device,
    error::{CflErr, Result},
    oracle::{OracleErr, TrainingOracle},
    params::ParameterMap,
    server::Server,
};

/// A participant of the federation training on its own private data.
///
/// Besides its live parameters `W` it keeps three snapshots of the same shape: the
/// rollback point taken at the last synchronization, the parameters before the last
/// local update and the accumulated weight delta `dW`.
#[derive(Debug)]
pub struct Client<O: TrainingOracle> {
    id: usize,
    device: Device<O>,
    data: DataSplit,
    synced: ParameterMap,
    previous: ParameterMap,
    delta: ParameterMap,
    learning_rate: f32,
    lr_decay: f32,
    rng: StdRng,
}

impl<O: TrainingOracle> Client<O> {
    /// Creates a new `Client`.
    ///
    /// The client splits `dataset` into train and eval sets with its own seeded random
    /// source, so the same config and id always produce the same split.
    ///
    /// # Arguments
    /// * `id` - The position of the client in the roster.
    /// * `device` - The model and oracle owned by this client.
    /// * `dataset` - The client's private samples.
    /// * `config` - The federation settings.
    ///
    /// # Returns
    /// An `InvalidConfig` error if the dataset can't be split.
    pub fn new(id: usize, device: Device<O>, dataset: Dataset, config: &FederationConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1 + id as u64));
        let data = dataset.split(config.train_fraction, &mut rng)?;
        let params = device.params();

        Ok(Self {
            id,
            synced: params.clone(),
            previous: params.zeros_like(),
            delta: params.zeros_like(),
            device,
            data,
            learning_rate: config.learning_rate,
            lr_decay: config.lr_decay,
            rng,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The live parameters `W`.
    pub fn params(&self) -> &ParameterMap {
        self.device.params()
    }

    pub(crate) fn params_mut(&mut self) -> &mut ParameterMap {
        self.device.params_mut()
    }

    /// The accumulated weight delta `dW`.
    pub fn delta(&self) -> &ParameterMap {
        &self.delta
    }

    /// The rollback point recorded at the last synchronization.
    pub fn synced(&self) -> &ParameterMap {
        &self.synced
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn device(&self) -> &Device<O> {
        &self.device
    }

    /// Replaces `W` with the server's global parameters and records them as rollback point.
    pub fn synchronize_with_server<S: TrainingOracle>(&mut self, server: &Server<S>) -> Result<()> {
        self.synchronize_with(server.params())
    }

    /// Replaces `W` with `global` and records it as the rollback point.
    ///
    /// # Arguments
    /// * `global` - The parameters sent by the server.
    pub fn synchronize_with(&mut self, global: &ParameterMap) -> Result<()> {
        self.params_mut().copy_from(global)?;
        self.synced.copy_from(global)?;
        debug!(client = self.id; "synchronized with server");
        Ok(())
    }

    /// Records the current `W` as the rollback point.
    ///
    /// Used after the server aggregated a cohort update straight into `W`, which is a
    /// synchronization that didn't go through `synchronize_with`.
    pub fn commit_sync(&mut self) -> Result<()> {
        let Self { device, synced, .. } = self;
        synced.copy_from(device.params())
    }

    /// Runs local training and adds the resulting change of `W` into `dW`.
    ///
    /// The learning rate decays before every call and is never reset. `dW` is not cleared
    /// here: it sums every update since the caller last called `clear_delta`.
    ///
    /// # Arguments
    /// * `epochs` - The amount of local passes over the training set.
    ///
    /// # Returns
    /// The training loss, or `OracleFailure` if the oracle fails or produces non-finite
    /// values, in which case `dW` is left untouched and `reset` recovers `W`.
    pub fn compute_weight_update(&mut self, epochs: usize) -> Result<f32> {
        let Self {
            id,
            device,
            data,
            previous,
            delta,
            rng,
            ..
        } = self;

        previous.copy_from(device.params())?;
        self.learning_rate *= self.lr_decay;

        data.train.shuffle(rng);
        let loss = device
            .fit(&data.train, epochs, self.learning_rate)
            .and_then(|loss| {
                if loss.is_finite() && device.params().is_finite() {
                    Ok(loss)
                } else {
                    Err(OracleErr(format!("training diverged, loss {loss}")))
                }
            })
            .map_err(|e| {
                warn!(client = *id; "training failed: {e}");
                CflErr::OracleFailure {
                    client: Some(*id),
                    reason: e.0,
                }
            })?;

        delta.accumulate_difference(device.params(), previous)?;
        debug!(
            client = *id,
            device:% = device.target(),
            loss = loss,
            lr = self.learning_rate;
            "computed weight update"
        );
        Ok(loss)
    }

    /// Zeroes `dW`, the next update starts a fresh delta.
    pub fn clear_delta(&mut self) {
        self.delta.zero();
    }

    /// Restores `W` to the rollback point, discarding local training since the last
    /// synchronization. `dW` is kept.
    pub fn reset(&mut self) -> Result<()> {
        let Self { device, synced, .. } = self;
        device.params_mut().copy_from(synced)
    }

    /// Measures the accuracy of `W` on the client's evaluation set.
    pub fn evaluate(&mut self) -> Result<f32> {
        let Self {
            id, device, data, ..
        } = self;

        device.evaluate(&data.eval).map_err(|e| CflErr::OracleFailure {
            client: Some(*id),
            reason: e.0,
        })
    }
}
