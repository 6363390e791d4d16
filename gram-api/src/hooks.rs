use crate::runner::RunnerContext;
use gram_agents::{UpdateStats, adaptation::AdaptationStats};
use gram_core::Result;

/// Summary of one collection phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectStats {
    pub num_steps: usize,
    pub mean_step_reward: f32,
    pub completed_episodes: usize,
    pub mean_episode_return: Option<f32>,
    pub mean_episode_length: Option<f32>,
}

/// Callbacks around the runner's phases. Returning `true` from a hook stops training after the
/// current phase; the final checkpoint is still written.
pub trait RunnerHooks {
    fn init_hook(&mut self, _context: &RunnerContext) -> bool {
        false
    }

    fn post_collect_hook(&mut self, _context: &RunnerContext, _stats: &CollectStats) -> bool {
        false
    }

    fn post_update_hook(&mut self, _context: &RunnerContext, _stats: &UpdateStats) -> bool {
        false
    }

    fn post_adversary_hook(&mut self, _context: &RunnerContext, _stats: &UpdateStats) -> bool {
        false
    }

    fn post_adaptation_hook(&mut self, _context: &RunnerContext, _stats: &AdaptationStats) -> bool {
        false
    }

    fn shutdown_hook(&mut self, _context: &RunnerContext) -> Result<()> {
        Ok(())
    }
}

impl<H: RunnerHooks + ?Sized> RunnerHooks for Box<H> {
    fn init_hook(&mut self, context: &RunnerContext) -> bool {
        (**self).init_hook(context)
    }

    fn post_collect_hook(&mut self, context: &RunnerContext, stats: &CollectStats) -> bool {
        (**self).post_collect_hook(context, stats)
    }

    fn post_update_hook(&mut self, context: &RunnerContext, stats: &UpdateStats) -> bool {
        (**self).post_update_hook(context, stats)
    }

    fn post_adversary_hook(&mut self, context: &RunnerContext, stats: &UpdateStats) -> bool {
        (**self).post_adversary_hook(context, stats)
    }

    fn post_adaptation_hook(&mut self, context: &RunnerContext, stats: &AdaptationStats) -> bool {
        (**self).post_adaptation_hook(context, stats)
    }

    fn shutdown_hook(&mut self, context: &RunnerContext) -> Result<()> {
        (**self).shutdown_hook(context)
    }
}

pub struct EmptyRunnerHooks;

impl RunnerHooks for EmptyRunnerHooks {}

/// Reports progress through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingHooks {
    last_collect: Option<CollectStats>,
}

impl RunnerHooks for LoggingHooks {
    fn init_hook(&mut self, context: &RunnerContext) -> bool {
        tracing::info!(
            algorithm = %context.algorithm,
            max_iterations = context.max_iterations,
            finetune_iterations = context.finetune_iterations,
            ood_ratio = context.ood_ratio,
            "training started"
        );
        false
    }

    fn post_collect_hook(&mut self, _context: &RunnerContext, stats: &CollectStats) -> bool {
        self.last_collect = Some(stats.clone());
        false
    }

    fn post_update_hook(&mut self, context: &RunnerContext, stats: &UpdateStats) -> bool {
        let collect = self.last_collect.take().unwrap_or_default();
        tracing::info!(
            iteration = context.iteration,
            phase = ?context.phase,
            mean_step_reward = collect.mean_step_reward,
            episodes = collect.completed_episodes,
            mean_episode_return = collect.mean_episode_return,
            mean_episode_length = collect.mean_episode_length,
            surrogate = stats.surrogate_loss,
            value = stats.value_loss,
            entropy = stats.entropy,
            adaptation = stats.adaptation_loss,
            consistency = stats.consistency_loss,
            kl = stats.kl,
            lr = stats.learning_rate,
            "robust update"
        );
        false
    }

    fn post_adversary_hook(&mut self, context: &RunnerContext, stats: &UpdateStats) -> bool {
        tracing::info!(
            iteration = context.iteration,
            surrogate = stats.surrogate_loss,
            value = stats.value_loss,
            kl = stats.kl,
            lr = stats.learning_rate,
            "adversary update"
        );
        false
    }

    fn post_adaptation_hook(&mut self, context: &RunnerContext, stats: &AdaptationStats) -> bool {
        let collect = self.last_collect.take().unwrap_or_default();
        tracing::info!(
            adaptation_iteration = context.adaptation_iteration,
            mean_step_reward = collect.mean_step_reward,
            loss = stats.loss,
            batches = stats.num_batches,
            "adaptation update"
        );
        false
    }

    fn shutdown_hook(&mut self, context: &RunnerContext) -> Result<()> {
        tracing::info!(
            iterations = context.iteration,
            adaptation_iterations = context.adaptation_iteration,
            "training finished"
        );
        Ok(())
    }
}
