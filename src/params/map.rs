use std::collections::BTreeMap;

use ndarray::{Array, Array1, ArrayD, Dimension, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{CflErr, Result};

/// A named collection of numeric tensors, the parameters of a model.
///
/// `ParameterMap` is a value: it always owns its storage, so cloning it yields a deep
/// copy and no two maps can ever share a tensor. Keys iterate in lexicographic order,
/// which is the order used by `flatten`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterMap {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ParameterMap {
    /// Creates a new empty `ParameterMap`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tensor under `name`, replacing and returning any previous one.
    ///
    /// # Arguments
    /// * `name` - The unique name of the parameter.
    /// * `tensor` - The owned tensor, of any dimensionality.
    pub fn insert<K, D>(&mut self, name: K, tensor: Array<f32, D>) -> Option<ArrayD<f32>>
    where
        K: Into<String>,
        D: Dimension,
    {
        self.tensors.insert(name.into(), tensor.into_dyn())
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(name)
    }

    /// Returns the amount of named tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Returns the total amount of scalar parameters across every tensor.
    pub fn nparams(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Creates a map with the same keys and shapes as `self`, filled with zeros.
    pub fn zeros_like(&self) -> Self {
        let tensors = self
            .tensors
            .iter()
            .map(|(name, t)| (name.clone(), ArrayD::zeros(t.raw_dim())))
            .collect();

        Self { tensors }
    }

    /// Sets every element of every tensor to zero, keeping keys and shapes.
    pub fn zero(&mut self) {
        self.tensors.values_mut().for_each(|t| t.fill(0.));
    }

    /// Checks that `other` has exactly the same key set and per key shapes as `self`.
    ///
    /// # Arguments
    /// * `other` - The map to compare against.
    ///
    /// # Returns
    /// A `KeyMismatch` naming the first missing key or a `ShapeMismatch`.
    pub fn check_compatible(&self, other: &ParameterMap) -> Result<()> {
        for (name, tensor) in &self.tensors {
            let Some(theirs) = other.tensors.get(name) else {
                return Err(CflErr::KeyMismatch { key: name.clone() });
            };

            if tensor.shape() != theirs.shape() {
                return Err(CflErr::ShapeMismatch {
                    key: name.clone(),
                    got: theirs.shape().to_vec(),
                    expected: tensor.shape().to_vec(),
                });
            }
        }

        if let Some(extra) = other.names().find(|name| !self.tensors.contains_key(*name)) {
            return Err(CflErr::KeyMismatch {
                key: extra.to_string(),
            });
        }

        Ok(())
    }

    /// Overwrites every tensor of `self` with a copy of the matching tensor of `source`.
    ///
    /// # Arguments
    /// * `source` - The map to copy from, it must have the same keys and shapes.
    ///
    /// # Returns
    /// A `KeyMismatch` or `ShapeMismatch` error, in which case `self` is left untouched.
    pub fn copy_from(&mut self, source: &ParameterMap) -> Result<()> {
        self.check_compatible(source)?;

        for (name, tensor) in self.tensors.iter_mut() {
            tensor.assign(&source.tensors[name]);
        }

        Ok(())
    }

    /// Adds `other` elementwise into `self`.
    ///
    /// # Arguments
    /// * `other` - The map to add, it must have the same keys and shapes.
    pub fn accumulate(&mut self, other: &ParameterMap) -> Result<()> {
        self.check_compatible(other)?;

        for (name, tensor) in self.tensors.iter_mut() {
            *tensor += &other.tensors[name];
        }

        Ok(())
    }

    /// Adds `minuend - subtrahend` into the current contents of `self`.
    ///
    /// This has accumulate semantics: `self` is not zeroed first, so repeated calls
    /// sum every difference since the caller last zeroed `self`. Use
    /// `overwrite_difference` to replace the contents instead.
    ///
    /// # Arguments
    /// * `minuend` - The map to subtract from.
    /// * `subtrahend` - The map being subtracted.
    pub fn accumulate_difference(
        &mut self,
        minuend: &ParameterMap,
        subtrahend: &ParameterMap,
    ) -> Result<()> {
        self.check_compatible(minuend)?;
        self.check_compatible(subtrahend)?;

        for (name, tensor) in self.tensors.iter_mut() {
            Zip::from(tensor)
                .and(&minuend.tensors[name])
                .and(&subtrahend.tensors[name])
                .for_each(|t, &a, &b| *t += a - b);
        }

        Ok(())
    }

    /// Replaces the contents of `self` with `minuend - subtrahend`.
    ///
    /// # Arguments
    /// * `minuend` - The map to subtract from.
    /// * `subtrahend` - The map being subtracted.
    pub fn overwrite_difference(
        &mut self,
        minuend: &ParameterMap,
        subtrahend: &ParameterMap,
    ) -> Result<()> {
        self.check_compatible(minuend)?;
        self.check_compatible(subtrahend)?;

        for (name, tensor) in self.tensors.iter_mut() {
            Zip::from(tensor)
                .and(&minuend.tensors[name])
                .and(&subtrahend.tensors[name])
                .for_each(|t, &a, &b| *t = a - b);
        }

        Ok(())
    }

    /// Divides every element by `divisor`.
    pub fn div_scalar(&mut self, divisor: f32) {
        self.tensors
            .values_mut()
            .for_each(|t| t.mapv_inplace(|v| v / divisor));
    }

    /// Concatenates every tensor, in key order, into a single vector.
    ///
    /// Only meant for similarity and norm computations, never for storage.
    pub fn flatten(&self) -> Array1<f32> {
        self.tensors
            .values()
            .flat_map(|t| t.iter().copied())
            .collect()
    }

    /// Returns the euclidean norm of the flattened map.
    pub fn norm(&self) -> f32 {
        self.tensors
            .values()
            .map(|t| t.iter().map(|v| v * v).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    /// Whether every element is neither NaN nor infinite.
    pub fn is_finite(&self) -> bool {
        self.tensors
            .values()
            .all(|t| t.iter().all(|v| v.is_finite()))
    }
}

impl FromIterator<(String, ArrayD<f32>)> for ParameterMap {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};

    use super::*;

    fn sample() -> ParameterMap {
        let mut map = ParameterMap::new();
        map.insert("dense.weight", arr2(&[[1., 2.], [3., 4.]]));
        map.insert("dense.bias", arr1(&[0.5, -0.5]));
        map
    }

    #[test]
    fn copy_then_flatten_is_identical() {
        let source = sample();
        let mut target = source.zeros_like();

        target.copy_from(&source).unwrap();
        assert_eq!(target.flatten(), source.flatten());
    }

    #[test]
    fn copy_does_not_alias_source() {
        let mut source = sample();
        let mut target = source.zeros_like();
        target.copy_from(&source).unwrap();

        source.get_mut("dense.bias").unwrap().fill(9.);
        assert_eq!(target.get("dense.bias").unwrap().as_slice().unwrap(), &[0.5, -0.5]);
    }

    #[test]
    fn copy_fails_on_missing_key_without_mutating() {
        let mut target = sample();
        let mut source = ParameterMap::new();
        source.insert("dense.weight", arr2(&[[0., 0.], [0., 0.]]));

        let err = target.copy_from(&source).unwrap_err();
        assert_eq!(
            err,
            CflErr::KeyMismatch {
                key: "dense.bias".into()
            }
        );
        assert_eq!(target, sample());
    }

    #[test]
    fn extra_source_key_is_a_mismatch() {
        let target = sample();
        let mut source = sample();
        source.insert("extra", arr1(&[1.]));

        assert!(matches!(
            target.check_compatible(&source),
            Err(CflErr::KeyMismatch { key }) if key == "extra"
        ));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let target = sample();
        let mut source = sample();
        source.insert("dense.bias", arr1(&[1., 2., 3.]));

        assert!(matches!(
            target.check_compatible(&source),
            Err(CflErr::ShapeMismatch { got, expected, .. }) if got == [3] && expected == [2]
        ));
    }

    #[test]
    fn difference_accumulates_until_zeroed() {
        let after = sample();
        let before = after.zeros_like();
        let mut delta = after.zeros_like();

        delta.accumulate_difference(&after, &before).unwrap();
        delta.accumulate_difference(&after, &before).unwrap();
        assert_eq!(delta.flatten().to_vec(), [1., -1., 2., 4., 6., 8.]);

        delta.overwrite_difference(&after, &before).unwrap();
        assert_eq!(delta.flatten(), after.flatten());

        delta.zero();
        assert!(delta.flatten().iter().all(|&v| v == 0.));
    }

    #[test]
    fn flatten_follows_key_order() {
        assert_eq!(sample().flatten().to_vec(), [0.5, -0.5, 1., 2., 3., 4.]);
    }

    #[test]
    fn norm_matches_flattened_norm() {
        let map = sample();
        let flat = map.flatten();
        let expected = flat.dot(&flat).sqrt();

        assert!((map.norm() - expected).abs() < 1e-6);
        assert_eq!(map.nparams(), 6);
    }

    #[test]
    fn non_finite_values_are_detected() {
        let mut map = sample();
        assert!(map.is_finite());

        map.get_mut("dense.weight").unwrap().as_slice_mut().unwrap()[0] = f32::NAN;
        assert!(!map.is_finite());
    }
}
