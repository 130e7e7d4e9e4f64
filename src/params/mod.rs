mod map;
mod ops;

pub use map::ParameterMap;
pub use ops::{accumulate_mean, mean, overwrite_mean};
