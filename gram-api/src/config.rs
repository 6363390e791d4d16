use anyhow::{Context as _, Result};
use gram_agents::{
    ActorCriticConfig, AdversaryConfig, AlgorithmKind, PpoConfig, adaptation::AdaptationConfig,
};
use gram_core::{
    GramError,
    context::{ContextRanges, IdContextSet},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the copy of the train config written into every run directory.
pub const TRAIN_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub log_root: PathBuf,
    pub experiment_name: String,
    /// Defaults to `<algorithm>_seed<seed>`.
    pub run_name: Option<String>,
    /// RL iterations between checkpoints, 0 disables intermediate checkpoints.
    pub save_interval: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("logs"),
            experiment_name: "unitree_go2_custom".to_owned(),
            run_name: None,
            save_interval: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub algorithm: AlgorithmKind,
    pub id_context_set: IdContextSet,
    /// Replaces the ranges of `id_context_set` when given.
    pub id_ranges: Option<ContextRanges>,
    /// Bounds of the contexts the adversary may choose.
    pub ood_ranges: ContextRanges,
    pub max_iterations: usize,
    pub finetune_iterations: usize,
    pub seed: u64,
    pub num_steps_per_env: usize,
    /// Fraction of RL iterations collected under adversarial contexts.
    pub ood_ratio: f64,
    /// Adds `gamma * value` to the reward of time-limited steps.
    pub bootstrap_timeouts: bool,
    pub policy: ActorCriticConfig,
    pub ppo: PpoConfig,
    pub adaptation: AdaptationConfig,
    pub adversary: AdversaryConfig,
    pub run: RunConfig,
    pub use_cuda: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmKind::Gram,
            id_context_set: IdContextSet::Default,
            id_ranges: None,
            ood_ranges: ContextRanges::out_of_distribution(),
            max_iterations: 10_000,
            finetune_iterations: 0,
            seed: 42,
            num_steps_per_env: 24,
            ood_ratio: 0.5,
            bootstrap_timeouts: true,
            policy: ActorCriticConfig::default(),
            ppo: PpoConfig::default(),
            adaptation: AdaptationConfig::default(),
            adversary: AdversaryConfig::default(),
            run: RunConfig::default(),
            use_cuda: false,
        }
    }
}

impl TrainConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading train config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing train config {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("writing train config {}", path.display()))
    }

    pub fn id_ranges(&self) -> ContextRanges {
        self.id_ranges
            .clone()
            .unwrap_or_else(|| self.id_context_set.ranges())
    }

    pub fn run_name(&self) -> String {
        self.run
            .run_name
            .clone()
            .unwrap_or_else(|| format!("{}_seed{}", self.algorithm, self.seed))
    }

    pub fn run_dir(&self) -> PathBuf {
        self.run
            .log_root
            .join(&self.run.experiment_name)
            .join(self.run_name())
    }

    /// Rejects inconsistent settings before anything is built.
    pub fn validate(&self, num_joints: usize) -> gram_core::Result<()> {
        self.id_ranges().validate(num_joints)?;
        self.ood_ranges.validate(num_joints)?;
        if self.num_steps_per_env == 0 {
            return Err(GramError::Config(
                "num_steps_per_env must be positive".to_owned(),
            ));
        }
        if !(0. ..=1.).contains(&self.ood_ratio) {
            return Err(GramError::Config(format!(
                "ood_ratio must lie in [0, 1], got {}",
                self.ood_ratio
            )));
        }
        if self.finetune_iterations > 0 && !self.algorithm.has_adaptation_module() {
            return Err(GramError::Config(format!(
                "finetune_iterations = {} requested, but {} has no adaptation module",
                self.finetune_iterations, self.algorithm
            )));
        }
        if self.algorithm.has_adaptation_module() && self.policy.history_len == 0 {
            return Err(GramError::Config(format!(
                "{} needs a positive history_len",
                self.algorithm
            )));
        }
        self.policy.validate()?;
        self.ppo.validate()?;
        self.ppo
            .lr_schedule
            .check_learning_rate(self.policy.learning_rate)?;
        if self.algorithm.uses_adversary() {
            self.adversary.validate()?;
        }
        if self.adaptation.num_learning_epochs == 0 || self.adaptation.num_mini_batches == 0 {
            return Err(GramError::Config(
                "adaptation needs at least one epoch and one mini-batch".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use gram_agents::ppo::lr_schedule::LrSchedule;
    use gram_core::context::ContextRange;

    #[test]
    fn defaults_are_valid() {
        TrainConfig::default().validate(12).unwrap();
    }

    #[test]
    fn finetuning_without_adaptation_module_fails_fast() {
        for algorithm in [AlgorithmKind::RobustRl, AlgorithmKind::DomainRand] {
            let config = TrainConfig {
                algorithm,
                finetune_iterations: 10,
                ..Default::default()
            };
            assert!(matches!(config.validate(12), Err(GramError::Config(_))));
        }
    }

    #[test]
    fn learning_rate_above_the_schedule_bound_fails_fast() {
        let mut config = TrainConfig::default();
        config.policy.learning_rate = 0.05;
        assert!(matches!(config.validate(12), Err(GramError::Config(_))));

        let mut config = TrainConfig::default();
        config.adversary.learning_rate = 0.05;
        assert!(matches!(config.validate(12), Err(GramError::Config(_))));

        let mut config = TrainConfig::default();
        config.ppo.lr_schedule = LrSchedule::Adaptive {
            desired_kl: 0.01,
            factor: 0.5,
            min_lr: 1e-5,
            max_lr: 1e-2,
        };
        assert!(matches!(config.validate(12), Err(GramError::Config(_))));
    }

    #[test]
    fn inverted_ranges_fail_fast() {
        let mut config = TrainConfig::default();
        config.ood_ranges.added_mass = ContextRange { min: 4., max: -4. };
        assert!(matches!(
            config.validate(12),
            Err(GramError::InvalidRange { .. })
        ));
    }

    #[test]
    fn algorithm_names_are_parsed_from_json() {
        let config: TrainConfig =
            serde_json::from_str(r#"{"algorithm": "gram_modular", "seed": 3}"#).unwrap();
        assert_eq!(config.algorithm, AlgorithmKind::GramModular);
        assert_eq!(config.run_name(), "gram_modular_seed3");
        assert!(serde_json::from_str::<TrainConfig>(r#"{"algorithm": "sac"}"#).is_err());
    }
}
