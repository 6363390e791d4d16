pub mod gae;
pub mod mini_batching;
pub mod rollout_storage;

pub use gae::compute_gae;
pub use mini_batching::{MiniBatch, MiniBatchGenerator};
pub use rollout_storage::{RolloutStorage, Transition};
