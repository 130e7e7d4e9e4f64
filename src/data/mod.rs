mod dataset;
mod provider;

pub use dataset::{DataSplit, Dataset};
pub use provider::DatasetProvider;
