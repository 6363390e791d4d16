use super::losses::PpoLosses;
use gram_core::{Result, storage::RolloutStorage};

pub enum HookResult {
    Continue,
    Break,
}

macro_rules! process_hook_result {
    ($hook_res:expr, $ret:expr) => {
        match $hook_res? {
            HookResult::Continue => {}
            HookResult::Break => return Ok($ret),
        }
    };
}

pub(crate) use process_hook_result;

pub trait PpoHooks {
    /// Called once per update, after returns are computed and before the first mini-batch.
    fn before_learning_hook(&mut self, _storage: &RolloutStorage) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }

    /// Called after every optimizer step. `Break` ends the update early.
    fn batch_hook(&mut self, _losses: &PpoLosses, _kl: f32) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }
}

pub struct EmptyPpoHooks;

impl PpoHooks for EmptyPpoHooks {}

/// Stops the update once a mini-batch's KL exceeds `1.5 * target_kl`.
pub struct KlEarlyStop {
    pub target_kl: f32,
}

impl PpoHooks for KlEarlyStop {
    fn batch_hook(&mut self, _losses: &PpoLosses, kl: f32) -> Result<HookResult> {
        if kl > 1.5 * self.target_kl {
            tracing::debug!(kl, target_kl = self.target_kl, "kl early stop");
            Ok(HookResult::Break)
        } else {
            Ok(HookResult::Continue)
        }
    }
}
