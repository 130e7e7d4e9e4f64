use std::num::NonZeroUsize;

use log::trace;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::{OracleErr, TrainingOracle};
use crate::{config::ComputeTarget, data::Dataset, params::ParameterMap};

const WEIGHT: &str = "dense.weight";
const BIAS: &str = "dense.bias";

/// A multinomial logistic regression trained with minibatch gradient descent on the
/// cross-entropy loss.
///
/// The model has two parameters, `dense.weight` of shape `[features, classes]` and
/// `dense.bias` of shape `[classes]`.
#[derive(Debug, Clone)]
pub struct SoftmaxRegression {
    features: usize,
    classes: usize,
    batch_size: NonZeroUsize,
    target: ComputeTarget,
}

impl SoftmaxRegression {
    /// Creates a new `SoftmaxRegression` oracle.
    ///
    /// # Arguments
    /// * `features` - The width of each sample.
    /// * `classes` - The amount of classes to predict.
    /// * `batch_size` - The amount of samples per gradient step.
    /// * `target` - Where this oracle runs its computations.
    pub fn new(
        features: usize,
        classes: usize,
        batch_size: NonZeroUsize,
        target: ComputeTarget,
    ) -> Self {
        Self {
            features,
            classes,
            batch_size,
            target,
        }
    }

    /// Samples a fresh set of parameters using LeCun normal initialization.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// An error if the amount of features is zero.
    pub fn init_params<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ParameterMap, OracleErr> {
        let std_dev = (1. / self.features as f32).sqrt();
        let normal = Normal::new(0., std_dev).map_err(|e| OracleErr(e.to_string()))?;

        let weight =
            Array2::from_shape_simple_fn((self.features, self.classes), || normal.sample(rng));

        let mut params = ParameterMap::new();
        params.insert(WEIGHT, weight);
        params.insert(BIAS, Array1::<f32>::zeros(self.classes));
        Ok(params)
    }

    fn check_data(&self, data: &Dataset) -> Result<(), OracleErr> {
        if data.is_empty() {
            return Err(OracleErr("the dataset is empty".into()));
        }

        if data.x_size() != self.features || data.y_size() != self.classes {
            return Err(OracleErr(format!(
                "expected {}x{} samples, got {}x{}",
                self.features,
                self.classes,
                data.x_size(),
                data.y_size()
            )));
        }

        Ok(())
    }
}

fn view2<'a>(params: &'a ParameterMap, name: &str) -> Result<ArrayView2<'a, f32>, OracleErr> {
    lookup(params, name)?
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| OracleErr(format!("`{name}`: {e}")))
}

fn view1<'a>(params: &'a ParameterMap, name: &str) -> Result<ArrayView1<'a, f32>, OracleErr> {
    lookup(params, name)?
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|e| OracleErr(format!("`{name}`: {e}")))
}

fn lookup<'a>(params: &'a ParameterMap, name: &str) -> Result<&'a ArrayD<f32>, OracleErr> {
    params
        .get(name)
        .ok_or_else(|| OracleErr(format!("missing parameter `{name}`")))
}

/// Row-wise softmax of `x.w + b`.
fn probabilities(
    x: ArrayView2<f32>,
    weight: ArrayView2<f32>,
    bias: ArrayView1<f32>,
) -> Array2<f32> {
    let mut logits = x.dot(&weight) + &bias;

    for mut row in logits.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }

    logits
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 { (i, v) } else { best }
        })
        .0
}

impl TrainingOracle for SoftmaxRegression {
    fn fit(
        &mut self,
        params: &mut ParameterMap,
        data: &Dataset,
        epochs: usize,
        learning_rate: f32,
    ) -> Result<f32, OracleErr> {
        self.check_data(data)?;
        trace!(target_device = self.target.to_string().as_str(); "fitting softmax regression");

        let mut loss = 0.;

        for _ in 0..epochs {
            let mut epoch_loss = 0.;

            for (x, y) in data.batches(self.batch_size) {
                let n = x.nrows() as f32;

                let (grad_w, grad_b, batch_loss) = {
                    let weight = view2(params, WEIGHT)?;
                    let bias = view1(params, BIAS)?;

                    let p = probabilities(x, weight, bias);
                    let batch_loss = -(&y * &p.mapv(|v| v.max(f32::MIN_POSITIVE).ln())).sum();

                    let delta = (p - &y) / n;
                    (x.t().dot(&delta), delta.sum_axis(Axis(0)), batch_loss)
                };

                lookup_mut(params, WEIGHT)?.scaled_add(-learning_rate, &grad_w.into_dyn());
                lookup_mut(params, BIAS)?.scaled_add(-learning_rate, &grad_b.into_dyn());
                epoch_loss += batch_loss;
            }

            loss = epoch_loss / data.len() as f32;
        }

        Ok(loss)
    }

    fn evaluate(&mut self, params: &ParameterMap, data: &Dataset) -> Result<f32, OracleErr> {
        self.check_data(data)?;

        let p = probabilities(data.x(), view2(params, WEIGHT)?, view1(params, BIAS)?);
        let correct = p
            .rows()
            .into_iter()
            .zip(data.y().rows())
            .filter(|(pred, truth)| argmax(pred.view()) == argmax(truth.view()))
            .count();

        Ok(correct as f32 / data.len() as f32)
    }
}

fn lookup_mut<'a>(
    params: &'a mut ParameterMap,
    name: &str,
) -> Result<&'a mut ArrayD<f32>, OracleErr> {
    params
        .get_mut(name)
        .ok_or_else(|| OracleErr(format!("missing parameter `{name}`")))
}
