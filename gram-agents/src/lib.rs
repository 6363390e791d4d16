pub mod actor_critic;
pub mod adaptation;
pub mod adversary;
pub mod algorithm;
pub mod policy;
pub mod ppo;

pub use actor_critic::{ActorCritic, ActorCriticBuilder, ActorCriticConfig, LatentSource};
pub use adversary::{Adversary, AdversaryConfig};
pub use algorithm::AlgorithmKind;
pub use policy::{ActionSample, PolicyEvaluation, PolicyInput, TrainablePolicy};
pub use ppo::{Ppo, PpoConfig, UpdateStats};
