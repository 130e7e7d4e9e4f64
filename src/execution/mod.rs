mod executor;

pub use executor::{LocalRound, RoundExecutor, RoundOutcome};
