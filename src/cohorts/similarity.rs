use ndarray::{Array1, Array2, Axis, Zip};
use rayon::prelude::*;

use crate::{
    error::{CflErr, Result},
    params::ParameterMap,
};

/// Guards the cosine quotient against near zero vectors.
pub const EPSILON: f32 = 1e-12;

/// Builds the pairwise cosine similarity matrix of `sources`.
///
/// Entry `(i, j)` is `dot(i, j) / (norm(i) * norm(j) + EPSILON)` over the flattened maps.
/// The result is always computed fresh, symmetric by construction and has a unit
/// diagonal for every nonzero input.
///
/// # Arguments
/// * `sources` - The ordered maps to compare, usually client deltas.
///
/// # Returns
/// An `N x N` matrix, or `InsufficientMembers` if `sources` is empty.
pub fn pairwise_cosine_similarity(sources: &[&ParameterMap]) -> Result<Array2<f32>> {
    let Some((first, rest)) = sources.split_first() else {
        return Err(CflErr::InsufficientMembers {
            op: "pairwise_cosine_similarity",
            got: 0,
            required: 1,
        });
    };

    for source in rest {
        first.check_compatible(source)?;
    }

    let flat: Vec<Array1<f32>> = sources.par_iter().map(|s| s.flatten()).collect();
    let norms: Vec<f32> = flat.iter().map(|v| v.dot(v).sqrt()).collect();

    let n = sources.len();
    let mut similarity = Array2::zeros((n, n));

    Zip::indexed(&mut similarity).par_for_each(|(i, j), s| {
        if i <= j {
            *s = flat[i].dot(&flat[j]) / (norms[i] * norms[j] + EPSILON);
        }
    });

    for i in 0..n {
        for j in 0..i {
            similarity[[i, j]] = similarity[[j, i]];
        }
    }

    Ok(similarity)
}

/// Extracts the square sub-matrix of `similarity` for the given positions.
///
/// # Arguments
/// * `similarity` - A square similarity matrix.
/// * `indices` - Row/column positions to keep, in output order.
///
/// # Returns
/// `UnknownMember` if any position is out of range.
pub fn restrict(similarity: &Array2<f32>, indices: &[usize]) -> Result<Array2<f32>> {
    let n = similarity.nrows();

    if let Some(&index) = indices.iter().find(|&&i| i >= n) {
        return Err(CflErr::UnknownMember { index, roster: n });
    }

    Ok(similarity
        .select(Axis(0), indices)
        .select(Axis(1), indices))
}
