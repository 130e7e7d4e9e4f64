use ndarray::{Array2, Axis};

use crate::error::{CflErr, Result};

/// A binary split of a set of members into two disjoint, non-empty cohorts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAssignment {
    first: Vec<usize>,
    second: Vec<usize>,
}

impl ClusterAssignment {
    /// The cohort holding the lowest position, sorted ascending.
    pub fn first(&self) -> &[usize] {
        &self.first
    }

    /// The remaining cohort, sorted ascending.
    pub fn second(&self) -> &[usize] {
        &self.second
    }

    pub fn into_parts(self) -> (Vec<usize>, Vec<usize>) {
        (self.first, self.second)
    }

    /// Translates local positions into the ids in `members`.
    ///
    /// # Arguments
    /// * `members` - The ids the similarity matrix rows stood for, in row order.
    ///
    /// # Returns
    /// `UnknownMember` if a position has no matching id.
    pub fn remap(&self, members: &[usize]) -> Result<ClusterAssignment> {
        let lookup = |positions: &[usize]| {
            positions
                .iter()
                .map(|&p| {
                    members.get(p).copied().ok_or(CflErr::UnknownMember {
                        index: p,
                        roster: members.len(),
                    })
                })
                .collect::<Result<Vec<_>>>()
        };

        Ok(ClusterAssignment {
            first: lookup(&self.first)?,
            second: lookup(&self.second)?,
        })
    }
}

/// Bipartitions the members of a similarity matrix with complete-linkage clustering.
///
/// Similarities are turned into distances with `distance = -similarity` and clusters are
/// merged bottom-up, always joining the pair with the smallest maximum member distance,
/// until two remain. Equal linkages resolve to the pair whose lowest members come first,
/// so the output only depends on the matrix.
///
/// # Arguments
/// * `similarity` - A square similarity matrix.
///
/// # Returns
/// The split, `NonSquareMatrix` or `InsufficientMembers` if there are fewer than two rows.
pub fn split_cluster(similarity: &Array2<f32>) -> Result<ClusterAssignment> {
    let (rows, cols) = similarity.dim();

    if rows != cols {
        return Err(CflErr::NonSquareMatrix { rows, cols });
    }

    if rows < 2 {
        return Err(CflErr::InsufficientMembers {
            op: "split_cluster",
            got: rows,
            required: 2,
        });
    }

    let distance = similarity.mapv(|s| -s);
    let mut clusters = complete_linkage(&distance, 2);

    // Clusters stay ordered by their lowest member.
    let second = clusters.pop().unwrap_or_default();
    let first = clusters.pop().unwrap_or_default();
    Ok(ClusterAssignment { first, second })
}

fn complete_linkage(distance: &Array2<f32>, target: usize) -> Vec<Vec<usize>> {
    let mut clusters: Vec<Vec<usize>> = (0..distance.nrows()).map(|i| vec![i]).collect();
    let mut linkage = distance.clone();

    while clusters.len() > target {
        let m = clusters.len();
        let (mut a, mut b, mut best) = (0, 1, f32::INFINITY);

        for i in 0..m {
            for j in i + 1..m {
                let d = linkage[[i, j]].max(linkage[[j, i]]);
                if d < best {
                    (a, b, best) = (i, j, d);
                }
            }
        }

        for c in 0..m {
            if c != a && c != b {
                let d = linkage[[a, c]].max(linkage[[b, c]]);
                linkage[[a, c]] = d;
                linkage[[c, a]] = d;
            }
        }

        let merged = clusters.remove(b);
        clusters[a].extend(merged);
        clusters[a].sort_unstable();

        let keep: Vec<usize> = (0..m).filter(|&i| i != b).collect();
        linkage = linkage.select(Axis(0), &keep).select(Axis(1), &keep);
    }

    clusters
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;
    use crate::{cohorts::pairwise_cosine_similarity, params::ParameterMap};

    fn delta(values: [f32; 2]) -> ParameterMap {
        let mut map = ParameterMap::new();
        map.insert("w", ndarray::arr1(&values));
        map
    }

    #[test]
    fn splits_two_opposite_groups() {
        let deltas = [
            delta([1., 0.]),
            delta([0.9, 0.1]),
            delta([-1., 0.]),
            delta([-0.9, -0.1]),
        ];
        let refs: Vec<_> = deltas.iter().collect();
        let s = pairwise_cosine_similarity(&refs).unwrap();

        assert!(s[[0, 1]] > 0.95);
        assert!(s[[2, 3]] > 0.95);
        assert!(s[[0, 2]] < -0.95);
        assert!(s[[0, 3]] < -0.9);

        let split = split_cluster(&s).unwrap();
        assert_eq!(split.first(), [0, 1]);
        assert_eq!(split.second(), [2, 3]);
    }

    #[test]
    fn interleaved_groups_are_recovered() {
        let deltas = [
            delta([1., 0.1]),
            delta([-1., 0.]),
            delta([0.8, 0.]),
            delta([-0.7, -0.2]),
            delta([1., -0.1]),
        ];
        let refs: Vec<_> = deltas.iter().collect();
        let s = pairwise_cosine_similarity(&refs).unwrap();

        let split = split_cluster(&s).unwrap();
        assert_eq!(split.first(), [0, 2, 4]);
        assert_eq!(split.second(), [1, 3]);
    }

    #[test]
    fn two_members_split_into_singletons() {
        let s = arr2(&[[1., 0.2], [0.2, 1.]]);
        let split = split_cluster(&s).unwrap();
        assert_eq!(split.into_parts(), (vec![0], vec![1]));
    }

    #[test]
    fn ties_resolve_to_lowest_positions() {
        // Every pair is equally similar.
        let s = arr2(&[[1., 0.5, 0.5], [0.5, 1., 0.5], [0.5, 0.5, 1.]]);
        let split = split_cluster(&s).unwrap();
        assert_eq!(split.first(), [0, 1]);
        assert_eq!(split.second(), [2]);
    }

    #[test]
    fn rejects_single_member_and_non_square() {
        let single = arr2(&[[1.]]);
        assert!(matches!(
            split_cluster(&single),
            Err(CflErr::InsufficientMembers { got: 1, required: 2, .. })
        ));

        let rect = Array2::<f32>::zeros((2, 3));
        assert_eq!(
            split_cluster(&rect),
            Err(CflErr::NonSquareMatrix { rows: 2, cols: 3 })
        );
    }

    #[test]
    fn remap_translates_positions() {
        let s = arr2(&[[1., -1.], [-1., 1.]]);
        let split = split_cluster(&s).unwrap().remap(&[7, 3]).unwrap();
        assert_eq!(split.first(), [7]);
        assert_eq!(split.second(), [3]);

        assert!(split_cluster(&s).unwrap().remap(&[7]).is_err());
    }
}
