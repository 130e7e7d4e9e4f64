use std::{fmt, fs, num::NonZeroUsize, path::Path, thread, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CflErr, Result};

/// Where a device runs its numeric work, assigned explicitly at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeTarget {
    #[default]
    Cpu,
    Accelerator {
        ordinal: u32,
    },
}

impl fmt::Display for ComputeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeTarget::Cpu => f.write_str("cpu"),
            ComputeTarget::Accelerator { ordinal } => write!(f, "accelerator:{ordinal}"),
        }
    }
}

/// What happens to a client's accumulated delta between rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaPolicy {
    /// The delta is cleared before each round's update, it holds a single round.
    #[default]
    PerRound,
    /// The delta is never cleared, it sums every update since the federation started.
    Accumulate,
}

/// How participating clients are aggregated every round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cohorts split on divergence and are aggregated independently.
    #[default]
    Clustered,
    /// A single global model is averaged every round.
    FedAvg,
}

/// Every knob of a federation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub rounds: usize,
    pub local_epochs: usize,
    pub participation: f32,
    pub train_fraction: f32,
    pub batch_size: NonZeroUsize,
    pub learning_rate: f32,
    pub lr_decay: f32,
    pub mean_norm_threshold: f32,
    pub max_norm_threshold: f32,
    pub warmup_rounds: usize,
    pub min_split_size: usize,
    pub delta_policy: DeltaPolicy,
    pub strategy: Strategy,
    pub parallelism: NonZeroUsize,
    pub client_timeout_ms: Option<u64>,
    pub seed: u64,
    pub targets: Vec<ComputeTarget>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            rounds: 50,
            local_epochs: 1,
            participation: 1.,
            train_fraction: 0.8,
            batch_size: NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN),
            learning_rate: 0.1,
            lr_decay: 0.99,
            mean_norm_threshold: 0.4,
            max_norm_threshold: 1.6,
            warmup_rounds: 20,
            min_split_size: 3,
            delta_policy: DeltaPolicy::default(),
            strategy: Strategy::default(),
            parallelism: thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            client_timeout_ms: None,
            seed: 0,
            targets: vec![ComputeTarget::Cpu],
        }
    }
}

impl FederationConfig {
    /// Loads a configuration from a JSON file, missing fields take their default value.
    ///
    /// # Arguments
    /// * `path` - The location of the JSON file.
    ///
    /// # Returns
    /// An `InvalidConfig` error if the file can't be read, parsed or validated.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| CflErr::InvalidConfig(format!("cannot read {}: {e}", path.display())))?;

        Self::from_json(&content)
    }

    /// Parses and validates a configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| CflErr::InvalidConfig(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks every value is in its allowed range.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CflErr::InvalidConfig(msg));

        if !(self.participation > 0. && self.participation <= 1.) {
            return invalid(format!("participation must be in (0, 1], got {}", self.participation));
        }

        if !(self.train_fraction > 0. && self.train_fraction < 1.) {
            return invalid(format!("train_fraction must be in (0, 1), got {}", self.train_fraction));
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }

        if !(self.lr_decay > 0. && self.lr_decay <= 1.) {
            return invalid(format!("lr_decay must be in (0, 1], got {}", self.lr_decay));
        }

        if self.local_epochs == 0 {
            return invalid("local_epochs must be at least 1".into());
        }

        if self.min_split_size < 2 {
            return invalid(format!("min_split_size must be at least 2, got {}", self.min_split_size));
        }

        if self.targets.is_empty() {
            return invalid("at least one compute target is required".into());
        }

        Ok(())
    }

    /// Returns the compute target of the `i`-th device, targets are handed out round-robin.
    pub fn target_for(&self, i: usize) -> ComputeTarget {
        self.targets
            .get(i % self.targets.len().max(1))
            .copied()
            .unwrap_or_default()
    }

    pub fn client_timeout(&self) -> Option<Duration> {
        self.client_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = FederationConfig::from_json(r#"{ "rounds": 3, "seed": 9 }"#).unwrap();
        assert_eq!(config.rounds, 3);
        assert_eq!(config.seed, 9);
        assert_eq!(config.lr_decay, 0.99);
        assert_eq!(config.train_fraction, 0.8);
        assert_eq!(config.strategy, Strategy::Clustered);
        assert_eq!(config.delta_policy, DeltaPolicy::PerRound);
    }

    #[test]
    fn enums_parse_from_snake_case() {
        let json = r#"{
            "strategy": "fed_avg",
            "delta_policy": "accumulate",
            "targets": ["cpu", { "accelerator": { "ordinal": 1 } }],
            "client_timeout_ms": 250
        }"#;
        let config = FederationConfig::from_json(json).unwrap();

        assert_eq!(config.strategy, Strategy::FedAvg);
        assert_eq!(config.delta_policy, DeltaPolicy::Accumulate);
        assert_eq!(config.target_for(0), ComputeTarget::Cpu);
        assert_eq!(config.target_for(3), ComputeTarget::Accelerator { ordinal: 1 });
        assert_eq!(config.client_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.target_for(1).to_string(), "accelerator:1");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for json in [
            r#"{ "participation": 0.0 }"#,
            r#"{ "train_fraction": 1.0 }"#,
            r#"{ "lr_decay": 1.5 }"#,
            r#"{ "min_split_size": 1 }"#,
            r#"{ "targets": [] }"#,
            r#"{ "local_epochs": 0 }"#,
            r#"{ "rounds": "many" }"#,
        ] {
            assert!(
                matches!(FederationConfig::from_json(json), Err(CflErr::InvalidConfig(_))),
                "{json} should be rejected"
            );
        }
    }
}
