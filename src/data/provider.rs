use super::Dataset;
use crate::error::Result;

/// Supplies the private dataset of each client in the federation.
pub trait DatasetProvider {
    /// Should return the full dataset owned by `client`.
    ///
    /// The same `client` must always yield the same samples, the train/eval split is
    /// done afterwards by the client itself.
    ///
    /// # Arguments
    /// * `client` - The id of the client, its position in the roster.
    fn provide(&mut self, client: usize) -> Result<Dataset>;
}

impl<F> DatasetProvider for F
where
    F: FnMut(usize) -> Result<Dataset>,
{
    fn provide(&mut self, client: usize) -> Result<Dataset> {
        self(client)
    }
}
