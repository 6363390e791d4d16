use crate::{
    error::{GramError, Result},
    rng::RNG,
};
use candle_core::Tensor;
use candle_nn::VarMap;
use rand::Rng;

/// Re-draws every linear layer of `varmap` from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` using the
/// seeded generator. Variables are visited in name order, so a seed fixes the weights. Tensors
/// that are neither a `weight` nor a matching `bias` keep their initial value.
pub fn reinit_vars(varmap: &VarMap) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| GramError::Config("variable map lock poisoned".to_owned()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let var = &data[name];
        let fan_in = if name.ends_with("weight") {
            var.dims().get(1).copied()
        } else if let Some(prefix) = name.strip_suffix("bias") {
            data.get(&format!("{prefix}weight"))
                .and_then(|weight| weight.dims().get(1).copied())
        } else {
            None
        };
        let Some(fan_in) = fan_in.filter(|fan_in| *fan_in > 0) else {
            continue;
        };
        let bound = 1. / (fan_in as f32).sqrt();
        let values: Vec<f32> = RNG.with_borrow_mut(|rng| {
            (0..var.elem_count())
                .map(|_| rng.random_range(-bound..bound))
                .collect()
        });
        let values = Tensor::from_vec(values, var.shape(), var.device())?;
        var.set(&values)?;
    }
    Ok(())
}
