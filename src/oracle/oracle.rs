use std::{
    error::Error,
    fmt::{self, Display},
};

use crate::{data::Dataset, params::ParameterMap};

/// Error reported by a `TrainingOracle` whenever it can't train or evaluate a model.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleErr(pub String);

impl Display for OracleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for OracleErr {}

/// The learning capability every device delegates to: forward/backward passes and
/// optimizer steps over a model described by a `ParameterMap`.
pub trait TrainingOracle: Send {
    /// Should train the model for `epochs` passes over `data`, mutating `params` in place.
    ///
    /// # Arguments
    /// * `params` - The live parameters of the model.
    /// * `data` - The training samples, iterated in their current order.
    /// * `epochs` - The amount of passes over `data`.
    /// * `learning_rate` - The step size to use for this call.
    ///
    /// # Returns
    /// The training loss of the last epoch.
    fn fit(
        &mut self,
        params: &mut ParameterMap,
        data: &Dataset,
        epochs: usize,
        learning_rate: f32,
    ) -> Result<f32, OracleErr>;

    /// Should measure the accuracy of the model on `data` without modifying it.
    ///
    /// # Returns
    /// The share of correctly predicted samples, in `[0, 1]`.
    fn evaluate(&mut self, params: &ParameterMap, data: &Dataset) -> Result<f32, OracleErr>;
}
