use std::num::NonZeroUsize;

use ndarray::{Array2, ArrayView2, Axis};
use rand::{seq::SliceRandom, Rng};

use crate::error::{CflErr, Result};

/// A set of samples stored row-wise, features in `x` and one-hot targets in `y`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    x: Array2<f32>,
    y: Array2<f32>,
}

/// A client's dataset divided into a training and an evaluation part.
#[derive(Debug, Clone)]
pub struct DataSplit {
    pub train: Dataset,
    pub eval: Dataset,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Arguments
    /// * `x` - The samples, one per row.
    /// * `y` - The targets, one per row.
    ///
    /// # Returns
    /// A `ShapeMismatch` if `x` and `y` have a different amount of rows.
    pub fn new(x: Array2<f32>, y: Array2<f32>) -> Result<Self> {
        if x.nrows() != y.nrows() {
            return Err(CflErr::ShapeMismatch {
                key: "y".into(),
                got: y.shape().to_vec(),
                expected: vec![x.nrows(), y.ncols()],
            });
        }

        Ok(Self { x, y })
    }

    /// Creates a new `Dataset` with one-hot encoded class labels.
    ///
    /// # Arguments
    /// * `x` - The samples, one per row.
    /// * `labels` - The class of each sample.
    /// * `classes` - The total amount of classes.
    ///
    /// # Returns
    /// An `InvalidConfig` error if a label is not below `classes`.
    pub fn from_labels(x: Array2<f32>, labels: &[usize], classes: usize) -> Result<Self> {
        let mut y = Array2::zeros((labels.len(), classes));

        for (row, &label) in labels.iter().enumerate() {
            if label >= classes {
                return Err(CflErr::InvalidConfig(format!(
                    "label {label} is out of range for {classes} classes"
                )));
            }

            y[[row, label]] = 1.;
        }

        Self::new(x, y)
    }

    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn x_size(&self) -> usize {
        self.x.ncols()
    }

    pub fn y_size(&self) -> usize {
        self.y.ncols()
    }

    pub fn x(&self) -> ArrayView2<'_, f32> {
        self.x.view()
    }

    pub fn y(&self) -> ArrayView2<'_, f32> {
        self.y.view()
    }

    /// Randomly permutes the samples.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.x = self.x.select(Axis(0), &order);
        self.y = self.y.select(Axis(0), &order);
    }

    /// Iterates the samples in their current order, in batches of at most `batch_size` rows.
    pub fn batches(
        &self,
        batch_size: NonZeroUsize,
    ) -> impl Iterator<Item = (ArrayView2<'_, f32>, ArrayView2<'_, f32>)> {
        self.x
            .axis_chunks_iter(Axis(0), batch_size.get())
            .zip(self.y.axis_chunks_iter(Axis(0), batch_size.get()))
    }

    /// Randomly divides the samples into a training and an evaluation set.
    ///
    /// # Arguments
    /// * `train_fraction` - Share of the samples used for training, in `(0, 1]`.
    /// * `rng` - The random source deciding which samples go where.
    ///
    /// # Returns
    /// An `InvalidConfig` error if the fraction is out of range.
    pub fn split<R: Rng + ?Sized>(mut self, train_fraction: f32, rng: &mut R) -> Result<DataSplit> {
        if !(train_fraction > 0. && train_fraction <= 1.) {
            return Err(CflErr::InvalidConfig(format!(
                "train fraction must be in (0, 1], got {train_fraction}"
            )));
        }

        self.shuffle(rng);
        let n_train = (self.len() as f32 * train_fraction).floor() as usize;

        let (x_train, x_eval) = self.x.view().split_at(Axis(0), n_train);
        let (y_train, y_eval) = self.y.view().split_at(Axis(0), n_train);

        Ok(DataSplit {
            train: Dataset {
                x: x_train.to_owned(),
                y: y_train.to_owned(),
            },
            eval: Dataset {
                x: x_eval.to_owned(),
                y: y_eval.to_owned(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn numbered(n: usize) -> Dataset {
        let x = Array::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f32);
        let labels: Vec<usize> = (0..n).map(|i| i % 3).collect();
        Dataset::from_labels(x, &labels, 3).unwrap()
    }

    #[test]
    fn split_is_deterministic_for_a_seed() {
        let a = numbered(10).split(0.8, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = numbered(10).split(0.8, &mut StdRng::seed_from_u64(7)).unwrap();

        assert_eq!(a.train.len(), 8);
        assert_eq!(a.eval.len(), 2);
        assert_eq!(a.train, b.train);
        assert_eq!(a.eval, b.eval);
    }

    #[test]
    fn shuffle_keeps_rows_paired() {
        let mut data = numbered(12);
        data.shuffle(&mut StdRng::seed_from_u64(3));

        for (x, y) in data.x().rows().into_iter().zip(data.y().rows()) {
            let i = (x[0] / 2.) as usize;
            assert_eq!(y[i % 3], 1.);
        }
    }

    #[test]
    fn batches_cover_every_row() {
        let data = numbered(10);
        let sizes: Vec<usize> = data
            .batches(NonZeroUsize::new(4).unwrap())
            .map(|(x, y)| {
                assert_eq!(x.nrows(), y.nrows());
                x.nrows()
            })
            .collect();

        assert_eq!(sizes, [4, 4, 2]);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(numbered(4).split(0., &mut StdRng::seed_from_u64(0)).is_err());
        assert!(numbered(4).split(1.5, &mut StdRng::seed_from_u64(0)).is_err());
        assert!(Dataset::from_labels(Array2::zeros((1, 1)), &[3], 3).is_err());
        assert!(Dataset::new(Array2::zeros((2, 1)), Array2::zeros((3, 1))).is_err());
    }
}
