pub mod distributions;
pub mod init;
pub mod mlp;
pub mod optimizer;

pub use distributions::DiagGaussian;
pub use init::reinit_vars;
pub use mlp::{ActivationKind, Mlp, build_mlp};
pub use optimizer::{OptimizerWithMaxGrad, clip_grad};
