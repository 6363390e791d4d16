//! On-disk checkpoints: one directory per tag holding the safetensors of every network group and
//! a `metadata.json` describing them.

use crate::runner::{RunnerContext, RunnerPhase};
use gram_agents::{ActorCritic, Adversary, AlgorithmKind, actor_critic::ActorCriticDims};
use gram_core::{GramError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;
pub const FINAL_TAG: &str = "final";

const METADATA_FILE: &str = "metadata.json";
const ACTOR_CRITIC_FILE: &str = "actor_critic.safetensors";
const ADAPTATION_FILE: &str = "adaptation_module.safetensors";
const ADVERSARY_FILE: &str = "adversary.safetensors";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub format_version: u32,
    pub algorithm: AlgorithmKind,
    pub iteration: usize,
    pub adaptation_iteration: usize,
    /// Phase the runner was in when the checkpoint was written.
    pub phase: RunnerPhase,
    pub dims: ActorCriticDims,
    pub has_adaptation_module: bool,
    pub has_adversary: bool,
}

fn checkpoint_err(path: &Path, err: impl std::fmt::Display) -> GramError {
    GramError::Checkpoint(format!("{}: {err}", path.display()))
}

pub fn iteration_tag(iteration: usize) -> String {
    format!("iter_{iteration:06}")
}

#[derive(Debug, Clone)]
pub struct Checkpointer {
    run_dir: PathBuf,
}

impl Checkpointer {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn checkpoint_dir(&self, tag: &str) -> PathBuf {
        self.run_dir.join("checkpoints").join(tag)
    }

    pub fn save(
        &self,
        tag: &str,
        actor_critic: &ActorCritic,
        adversary: Option<&Adversary>,
        context: &RunnerContext,
    ) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(tag);
        std::fs::create_dir_all(&dir)?;
        actor_critic
            .policy_varmap()
            .save(dir.join(ACTOR_CRITIC_FILE))?;
        if actor_critic.has_adaptation_module() {
            actor_critic
                .adaptation_varmap()
                .save(dir.join(ADAPTATION_FILE))?;
        }
        if let Some(adversary) = adversary {
            adversary.varmap().save(dir.join(ADVERSARY_FILE))?;
        }
        let metadata = CheckpointMetadata {
            format_version: FORMAT_VERSION,
            algorithm: actor_critic.algorithm(),
            iteration: context.iteration,
            adaptation_iteration: context.adaptation_iteration,
            phase: context.phase,
            dims: actor_critic.dims(),
            has_adaptation_module: actor_critic.has_adaptation_module(),
            has_adversary: adversary.is_some(),
        };
        let metadata_path = dir.join(METADATA_FILE);
        let raw = serde_json::to_string_pretty(&metadata)
            .map_err(|err| checkpoint_err(&metadata_path, err))?;
        std::fs::write(&metadata_path, raw)?;
        tracing::debug!(path = %dir.display(), "checkpoint saved");
        Ok(dir)
    }
}

pub fn load_metadata(dir: &Path) -> Result<CheckpointMetadata> {
    let path = dir.join(METADATA_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|err| checkpoint_err(&path, err))?;
    let metadata: CheckpointMetadata =
        serde_json::from_str(&raw).map_err(|err| checkpoint_err(&path, err))?;
    if metadata.format_version != FORMAT_VERSION {
        return Err(checkpoint_err(
            &path,
            format!(
                "unsupported format version {}, expected {FORMAT_VERSION}",
                metadata.format_version
            ),
        ));
    }
    Ok(metadata)
}

/// Loads a checkpoint into networks built for the same variant and dimensions.
pub fn load(
    dir: &Path,
    actor_critic: &mut ActorCritic,
    adversary: Option<&mut Adversary>,
) -> Result<CheckpointMetadata> {
    let metadata = load_metadata(dir)?;
    if metadata.algorithm != actor_critic.algorithm() {
        return Err(checkpoint_err(
            dir,
            format!(
                "checkpoint was trained with {}, not {}",
                metadata.algorithm,
                actor_critic.algorithm()
            ),
        ));
    }
    if metadata.dims != actor_critic.dims() {
        return Err(checkpoint_err(
            dir,
            format!(
                "dimension mismatch, checkpoint {:?} vs network {:?}",
                metadata.dims,
                actor_critic.dims()
            ),
        ));
    }
    actor_critic
        .policy_varmap_mut()
        .load(dir.join(ACTOR_CRITIC_FILE))?;
    if metadata.has_adaptation_module {
        actor_critic
            .adaptation_varmap_mut()
            .load(dir.join(ADAPTATION_FILE))?;
    }
    if let Some(adversary) = adversary {
        if !metadata.has_adversary {
            return Err(checkpoint_err(dir, "checkpoint holds no adversary"));
        }
        adversary.varmap_mut().load(dir.join(ADVERSARY_FILE))?;
    }
    Ok(metadata)
}
