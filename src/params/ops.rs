use super::ParameterMap;
use crate::error::{CflErr, Result};

/// Computes the elementwise mean of `sources`.
///
/// # Arguments
/// * `sources` - The maps to average, all with the same keys and shapes.
///
/// # Returns
/// A new standalone map, or `EmptySourceSet` if `sources` is empty.
pub fn mean(sources: &[&ParameterMap]) -> Result<ParameterMap> {
    let Some((first, rest)) = sources.split_first() else {
        return Err(CflErr::EmptySourceSet { op: "mean" });
    };

    let mut sum = (*first).clone();
    for source in rest {
        sum.accumulate(source)?;
    }

    sum.div_scalar(sources.len() as f32);
    Ok(sum)
}

/// Adds the mean of `sources` into every map in `targets`.
///
/// Each target receives the same contribution on top of its current contents.
/// Every target is validated before any of them is written.
///
/// # Arguments
/// * `targets` - The maps receiving the mean.
/// * `sources` - The maps to average.
///
/// # Returns
/// `EmptySourceSet` if `sources` is empty, or a key/shape mismatch.
pub fn accumulate_mean(targets: &mut [&mut ParameterMap], sources: &[&ParameterMap]) -> Result<()> {
    let avg = mean(sources)?;

    for target in targets.iter() {
        target.check_compatible(&avg)?;
    }

    for target in targets.iter_mut() {
        target.accumulate(&avg)?;
    }

    Ok(())
}

/// Replaces every map in `targets` with the mean of `sources`.
///
/// # Arguments
/// * `targets` - The maps being overwritten.
/// * `sources` - The maps to average.
///
/// # Returns
/// `EmptySourceSet` if `sources` is empty, or a key/shape mismatch.
pub fn overwrite_mean(targets: &mut [&mut ParameterMap], sources: &[&ParameterMap]) -> Result<()> {
    let avg = mean(sources)?;

    for target in targets.iter() {
        target.check_compatible(&avg)?;
    }

    for target in targets.iter_mut() {
        target.copy_from(&avg)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};

    use super::*;

    fn map(weight: [[f32; 2]; 2], bias: [f32; 2]) -> ParameterMap {
        let mut map = ParameterMap::new();
        map.insert("dense.weight", arr2(&weight));
        map.insert("dense.bias", arr1(&bias));
        map
    }

    #[test]
    fn single_source_mean_adds_itself() {
        let m = map([[1.5, -2.], [0.25, 4.]], [3., -0.125]);
        let mut t = map([[1., 1.], [1., 1.]], [1., 1.]);

        accumulate_mean(&mut [&mut t], &[&m]).unwrap();
        assert_eq!(t.flatten().to_vec(), [4., 0.875, 2.5, -1., 1.25, 5.]);
    }

    #[test]
    fn identical_sources_add_exactly_one_copy() {
        let m = map([[0.5, -1.], [2., 0.75]], [1., -4.]);
        let sources = [&m, &m, &m, &m];
        let mut t = m.zeros_like();

        accumulate_mean(&mut [&mut t], &sources).unwrap();
        assert_eq!(t, m);
    }

    #[test]
    fn identical_sources_are_close_for_any_count() {
        let m = map([[0.1, 0.2], [0.3, 0.7]], [1.1, -0.9]);
        let sources = [&m, &m, &m];
        let mut t = m.zeros_like();

        accumulate_mean(&mut [&mut t], &sources).unwrap();
        t.flatten()
            .iter()
            .zip(m.flatten().iter())
            .for_each(|(a, b)| assert!((a - b).abs() < 1e-6));
    }

    #[test]
    fn mean_is_broadcast_to_every_target() {
        let a = map([[2., 0.], [0., 2.]], [2., 2.]);
        let b = map([[0., 2.], [2., 0.]], [0., 0.]);
        let mut t1 = a.zeros_like();
        let mut t2 = map([[1., 1.], [1., 1.]], [1., 1.]);

        accumulate_mean(&mut [&mut t1, &mut t2], &[&a, &b]).unwrap();
        assert_eq!(t1.flatten().to_vec(), [1., 1., 1., 1., 1., 1.]);
        assert_eq!(t2.flatten().to_vec(), [2., 2., 2., 2., 2., 2.]);

        overwrite_mean(&mut [&mut t2], &[&a, &b]).unwrap();
        assert_eq!(t2, t1);
    }

    #[test]
    fn empty_sources_are_rejected() {
        let mut t = map([[0., 0.], [0., 0.]], [0., 0.]);
        let err = accumulate_mean(&mut [&mut t], &[]).unwrap_err();
        assert_eq!(err, CflErr::EmptySourceSet { op: "mean" });
    }

    #[test]
    fn mismatched_target_is_rejected_before_any_write() {
        let a = map([[1., 1.], [1., 1.]], [1., 1.]);
        let mut good = a.zeros_like();
        let mut bad = ParameterMap::new();
        bad.insert("dense.weight", arr2(&[[0., 0.], [0., 0.]]));

        assert!(accumulate_mean(&mut [&mut good, &mut bad], &[&a]).is_err());
        assert_eq!(good, a.zeros_like());
    }

    #[test]
    fn opposite_sources_average_to_zero() {
        let a = map([[1., -2.], [3., 0.5]], [0.25, 8.]);
        let mut b = a.zeros_like();
        b.overwrite_difference(&a.zeros_like(), &a).unwrap();

        let avg = mean(&[&a, &b]).unwrap();
        assert!(avg.flatten().iter().all(|&v| v == 0.));
    }
}
