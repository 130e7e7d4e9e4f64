mod oracle;
mod softmax;

pub use oracle::{OracleErr, TrainingOracle};
pub use softmax::SoftmaxRegression;
