use std::{thread, time::Duration};

use ndarray::{arr1, Array2};

use crate::{
    client::Client,
    config::{ComputeTarget, FederationConfig},
    data::Dataset,
    device::Device,
    oracle::{OracleErr, TrainingOracle},
    params::ParameterMap,
};

/// Builds a single tensor map named `w`.
pub(crate) fn vector(values: &[f32]) -> ParameterMap {
    let mut map = ParameterMap::new();
    map.insert("w", arr1(values));
    map
}

/// A client with zeroed parameters shaped like the oracle's shift.
pub(crate) fn client(id: usize, oracle: ShiftOracle) -> Client<ShiftOracle> {
    let params = vector(&vec![0.; oracle.shift.len()]);
    let device = Device::new(params, oracle, ComputeTarget::Cpu);
    let dataset = Dataset::from_labels(Array2::zeros((10, 1)), &[0; 10], 1).unwrap();
    Client::new(id, device, dataset, &FederationConfig::default()).unwrap()
}

/// Moves `w` by a fixed step per epoch, which makes every delta predictable.
#[derive(Debug, Clone)]
pub(crate) struct ShiftOracle {
    shift: Vec<f32>,
    loss: f32,
    accuracy: f32,
    fail: bool,
    poison: bool,
    delay: Option<Duration>,
}

impl ShiftOracle {
    pub(crate) fn new(shift: &[f32]) -> Self {
        Self {
            shift: shift.to_vec(),
            loss: 1.,
            accuracy: 0.5,
            fail: false,
            poison: false,
            delay: None,
        }
    }

    /// Moves the parameters and then reports an error.
    pub(crate) fn failing(shift: &[f32]) -> Self {
        Self {
            fail: true,
            ..Self::new(shift)
        }
    }

    /// Writes NaN into the parameters while still reporting the configured loss.
    pub(crate) fn poisoning(shift: &[f32]) -> Self {
        Self {
            poison: true,
            ..Self::new(shift)
        }
    }

    pub(crate) fn with_loss(self, loss: f32) -> Self {
        Self { loss, ..self }
    }

    pub(crate) fn with_accuracy(self, accuracy: f32) -> Self {
        Self { accuracy, ..self }
    }

    /// Blocks the calling thread for `delay` on every fit.
    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }
}

impl TrainingOracle for ShiftOracle {
    fn fit(
        &mut self,
        params: &mut ParameterMap,
        _data: &Dataset,
        epochs: usize,
        _learning_rate: f32,
    ) -> Result<f32, OracleErr> {
        let w = params
            .get_mut("w")
            .ok_or_else(|| OracleErr("missing `w`".into()))?;

        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        for _ in 0..epochs {
            w.iter_mut().zip(&self.shift).for_each(|(w, s)| *w += s);
        }

        if self.poison {
            w.fill(f32::NAN);
        }

        if self.fail {
            return Err(OracleErr("simulated failure".into()));
        }

        Ok(self.loss)
    }

    fn evaluate(&mut self, _params: &ParameterMap, _data: &Dataset) -> Result<f32, OracleErr> {
        Ok(self.accuracy)
    }
}
