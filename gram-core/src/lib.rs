pub mod context;
pub mod env;
pub mod error;
pub mod history;
pub mod nn;
pub mod rng;
pub mod storage;
pub mod tensors;

pub use error::{GramError, Result};
