use gram_core::GramError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The training variants. Each one is a fixed selection of sub-networks and loss terms, see the
/// capability predicates below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    /// Shared trunk with robust and adaptive paths, trained jointly with consistency
    /// regularization and adversarial OOD contexts.
    Gram,
    /// Context-conditioned policy trained on ID and adversarial contexts, no adaptation module.
    RobustRl,
    /// Context-conditioned policy, adaptation module trained afterwards.
    ContextualRl,
    /// Plain observation policy over randomized dynamics.
    DomainRand,
    /// Like gram, but ID data only trains the adaptive path and OOD data only the robust path.
    GramSeparate,
    /// Like gram, but the adaptive path has its own actor instead of sharing the trunk.
    GramModular,
}

impl AlgorithmKind {
    pub const ALL: [AlgorithmKind; 6] = [
        Self::Gram,
        Self::RobustRl,
        Self::ContextualRl,
        Self::DomainRand,
        Self::GramSeparate,
        Self::GramModular,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gram => "gram",
            Self::RobustRl => "robust_rl",
            Self::ContextualRl => "contextual_rl",
            Self::DomainRand => "domain_rand",
            Self::GramSeparate => "gram_separate",
            Self::GramModular => "gram_modular",
        }
    }

    pub fn context_conditioned(&self) -> bool {
        !matches!(self, Self::DomainRand)
    }

    pub fn has_adaptation_module(&self) -> bool {
        matches!(
            self,
            Self::Gram | Self::ContextualRl | Self::GramSeparate | Self::GramModular
        )
    }

    pub fn uses_adversary(&self) -> bool {
        matches!(
            self,
            Self::Gram | Self::RobustRl | Self::GramSeparate | Self::GramModular
        )
    }

    /// The adaptation loss is part of the RL objective, not only of a later fine-tuning phase.
    pub fn trains_adaptation_jointly(&self) -> bool {
        matches!(self, Self::Gram | Self::GramSeparate | Self::GramModular)
    }

    pub fn consistency_regularized(&self) -> bool {
        matches!(self, Self::Gram | Self::GramModular)
    }

    pub fn separate_adaptive_actor(&self) -> bool {
        matches!(self, Self::GramModular)
    }

    /// ID iterations act through the adaptive path instead of the robust one.
    pub fn adaptive_id_collection(&self) -> bool {
        matches!(self, Self::GramSeparate)
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlgorithmKind {
    type Err = GramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| GramError::UnknownAlgorithm(s.to_owned()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in AlgorithmKind::ALL {
            assert_eq!(kind.to_string().parse::<AlgorithmKind>().unwrap(), kind);
        }
        assert!(matches!(
            "ppo".parse::<AlgorithmKind>(),
            Err(GramError::UnknownAlgorithm(name)) if name == "ppo"
        ));
    }

    #[test]
    fn only_adaptive_variants_have_an_adaptation_module() {
        let adaptive: Vec<_> = AlgorithmKind::ALL
            .into_iter()
            .filter(AlgorithmKind::has_adaptation_module)
            .collect();
        assert_eq!(
            adaptive,
            vec![
                AlgorithmKind::Gram,
                AlgorithmKind::ContextualRl,
                AlgorithmKind::GramSeparate,
                AlgorithmKind::GramModular
            ]
        );
        assert!(!AlgorithmKind::DomainRand.context_conditioned());
        assert!(!AlgorithmKind::ContextualRl.uses_adversary());
    }
}
