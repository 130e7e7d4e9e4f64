mod clustering;
mod similarity;

pub use clustering::{split_cluster, ClusterAssignment};
pub use similarity::{pairwise_cosine_similarity, restrict, EPSILON};
