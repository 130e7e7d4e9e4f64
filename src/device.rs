use crate::{
    config::ComputeTarget,
    data::Dataset,
    oracle::{OracleErr, TrainingOracle},
    params::ParameterMap,
};

/// Holds a model's live parameters together with the oracle that trains them.
///
/// Both clients and the server own one, which is everything they have in common.
#[derive(Debug)]
pub struct Device<O: TrainingOracle> {
    params: ParameterMap,
    oracle: O,
    target: ComputeTarget,
}

impl<O: TrainingOracle> Device<O> {
    /// Creates a new `Device`.
    ///
    /// # Arguments
    /// * `params` - The initial parameters of the model.
    /// * `oracle` - The training oracle for this model.
    /// * `target` - Where the oracle runs.
    pub fn new(params: ParameterMap, oracle: O, target: ComputeTarget) -> Self {
        Self {
            params,
            oracle,
            target,
        }
    }

    pub fn params(&self) -> &ParameterMap {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut ParameterMap {
        &mut self.params
    }

    pub fn target(&self) -> ComputeTarget {
        self.target
    }

    /// Trains the live parameters in place through the oracle.
    pub fn fit(&mut self, data: &Dataset, epochs: usize, learning_rate: f32) -> Result<f32, OracleErr> {
        self.oracle.fit(&mut self.params, data, epochs, learning_rate)
    }

    /// Measures the accuracy of the live parameters on `data`.
    pub fn evaluate(&mut self, data: &Dataset) -> Result<f32, OracleErr> {
        self.oracle.evaluate(&self.params, data)
    }
}
