use serde::{Deserialize, Serialize};

use crate::{
    error::{CflErr, Result},
    params::ParameterMap,
};

/// A frozen record of a cohort model, kept for provenance.
///
/// Entries are only ever appended to the server's cache and expose no mutation, they
/// serialize as `{ members, params, accuracies }` for external checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCacheEntry {
    members: Vec<usize>,
    params: ParameterMap,
    accuracies: Vec<f32>,
}

impl ModelCacheEntry {
    /// Creates a new `ModelCacheEntry`.
    ///
    /// # Arguments
    /// * `members` - The roster positions of the cohort.
    /// * `params` - The parameters to snapshot, they are deep copied.
    /// * `accuracies` - Accuracy of every roster member, indexed by roster position.
    ///
    /// # Returns
    /// `UnknownMember` if a member has no accuracy.
    pub fn new(members: &[usize], params: &ParameterMap, accuracies: &[f32]) -> Result<Self> {
        let accuracies = members
            .iter()
            .map(|&i| {
                accuracies.get(i).copied().ok_or(CflErr::UnknownMember {
                    index: i,
                    roster: accuracies.len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            members: members.to_vec(),
            params: params.clone(),
            accuracies,
        })
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn params(&self) -> &ParameterMap {
        &self.params
    }

    /// The accuracy of each member, in the same order as `members`.
    pub fn accuracies(&self) -> &[f32] {
        &self.accuracies
    }
}
