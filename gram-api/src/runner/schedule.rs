use gram_agents::AlgorithmKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerPhase {
    CollectId,
    CollectOod,
    UpdateRobust,
    CollectAdapt,
    UpdateAdapt,
    Finished,
}

/// Progress through the training schedule. Transitions are a pure function of this struct, so the
/// schedule can be stepped without an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerContext {
    pub algorithm: AlgorithmKind,
    pub max_iterations: usize,
    pub finetune_iterations: usize,
    pub ood_ratio: f64,
    /// Completed RL iterations.
    pub iteration: usize,
    /// Completed adaptation fine-tuning iterations.
    pub adaptation_iteration: usize,
    pub phase: RunnerPhase,
}

impl RunnerContext {
    pub fn new(
        algorithm: AlgorithmKind,
        max_iterations: usize,
        finetune_iterations: usize,
        ood_ratio: f64,
    ) -> Self {
        let mut context = Self {
            algorithm,
            max_iterations,
            finetune_iterations,
            ood_ratio,
            iteration: 0,
            adaptation_iteration: 0,
            phase: RunnerPhase::Finished,
        };
        context.phase = context.rl_phase_or_next();
        context
    }

    /// Iteration `i` collects under adversarial contexts iff `floor((i + 1) * r) > floor(i * r)`,
    /// which spreads a fraction `r` of OOD iterations evenly over training.
    pub fn is_ood_iteration(&self, iteration: usize) -> bool {
        if !self.algorithm.uses_adversary() {
            return false;
        }
        let i = iteration as f64;
        ((i + 1.) * self.ood_ratio).floor() > (i * self.ood_ratio).floor()
    }

    pub fn adaptation_enabled(&self) -> bool {
        self.algorithm.has_adaptation_module() && self.finetune_iterations > 0
    }

    pub fn is_finished(&self) -> bool {
        self.phase == RunnerPhase::Finished
    }

    pub fn finish(&mut self) {
        self.phase = RunnerPhase::Finished;
    }

    fn rl_phase_or_next(&self) -> RunnerPhase {
        if self.iteration < self.max_iterations {
            if self.is_ood_iteration(self.iteration) {
                RunnerPhase::CollectOod
            } else {
                RunnerPhase::CollectId
            }
        } else {
            self.adaptation_phase_or_next()
        }
    }

    fn adaptation_phase_or_next(&self) -> RunnerPhase {
        if self.adaptation_enabled() && self.adaptation_iteration < self.finetune_iterations {
            RunnerPhase::CollectAdapt
        } else {
            RunnerPhase::Finished
        }
    }

    /// Moves to the next phase and returns it.
    pub fn advance(&mut self) -> RunnerPhase {
        self.phase = match self.phase {
            RunnerPhase::CollectId | RunnerPhase::CollectOod => RunnerPhase::UpdateRobust,
            RunnerPhase::UpdateRobust => {
                self.iteration += 1;
                self.rl_phase_or_next()
            }
            RunnerPhase::CollectAdapt => RunnerPhase::UpdateAdapt,
            RunnerPhase::UpdateAdapt => {
                self.adaptation_iteration += 1;
                self.adaptation_phase_or_next()
            }
            RunnerPhase::Finished => RunnerPhase::Finished,
        };
        self.phase
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn phases(mut context: RunnerContext) -> Vec<RunnerPhase> {
        let mut phases = vec![context.phase];
        while !context.is_finished() {
            phases.push(context.advance());
        }
        phases
    }

    #[test]
    fn rl_then_adaptation() {
        use RunnerPhase::*;
        let context = RunnerContext::new(AlgorithmKind::Gram, 2, 2, 0.5);
        assert_eq!(
            phases(context),
            vec![
                CollectId,
                UpdateRobust,
                CollectOod,
                UpdateRobust,
                CollectAdapt,
                UpdateAdapt,
                CollectAdapt,
                UpdateAdapt,
                Finished
            ]
        );
    }

    #[test]
    fn domain_rand_never_adapts() {
        let context = RunnerContext::new(AlgorithmKind::DomainRand, 3, 100, 0.5);
        let phases = phases(context);
        assert!(!phases.contains(&RunnerPhase::CollectAdapt));
        assert!(!phases.contains(&RunnerPhase::UpdateAdapt));
        assert!(!phases.contains(&RunnerPhase::CollectOod));
    }

    #[test]
    fn ood_fraction_follows_the_ratio() {
        for (ratio, expected) in [(0., 0), (0.25, 25), (0.5, 50), (1., 100)] {
            let context = RunnerContext::new(AlgorithmKind::RobustRl, 100, 0, ratio);
            let ood = (0..100).filter(|i| context.is_ood_iteration(*i)).count();
            assert_eq!(ood, expected, "ratio {ratio}");
        }
        let contextual = RunnerContext::new(AlgorithmKind::ContextualRl, 100, 0, 1.);
        assert!((0..100).all(|i| !contextual.is_ood_iteration(i)));
    }

    #[test]
    fn zero_iterations() {
        let context = RunnerContext::new(AlgorithmKind::Gram, 0, 0, 0.5);
        assert!(context.is_finished());
        let context = RunnerContext::new(AlgorithmKind::GramSeparate, 0, 1, 0.5);
        assert_eq!(context.phase, RunnerPhase::CollectAdapt);
    }
}
