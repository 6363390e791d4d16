use candle_core::{Result, Tensor, Var, backprop::GradStore};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

/// Backpropagates `loss` and rescales the gradients of `vars` so that their global norm does
/// not exceed `max_norm`.
pub fn clip_grad(loss: &Tensor, vars: &[Var], max_norm: f32) -> Result<GradStore> {
    let mut grad_store = loss.backward()?;
    let mut total_norm_squared = 0f32;
    for var in vars {
        if let Some(grad) = grad_store.get(var.as_tensor()) {
            total_norm_squared += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let total_norm = total_norm_squared.sqrt();
    if total_norm > max_norm {
        let clip_coef = (max_norm / (total_norm + 1e-6)) as f64;
        for var in vars {
            if let Some(grad) = grad_store.remove(var.as_tensor()) {
                grad_store.insert(var.as_tensor(), grad.affine(clip_coef, 0.)?);
            }
        }
    }
    Ok(grad_store)
}

pub struct OptimizerWithMaxGrad {
    optimizer: AdamW,
    max_grad_norm: Option<f32>,
    vars: Vec<Var>,
}

impl std::fmt::Debug for OptimizerWithMaxGrad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerWithMaxGrad")
            .field("learning_rate", &self.optimizer.learning_rate())
            .field("max_grad_norm", &self.max_grad_norm)
            .field("num_vars", &self.vars.len())
            .finish()
    }
}

impl OptimizerWithMaxGrad {
    /// Adam (AdamW without weight decay) over `vars`.
    pub fn adam(vars: Vec<Var>, learning_rate: f64, max_grad_norm: Option<f32>) -> Result<Self> {
        let params = ParamsAdamW {
            lr: learning_rate,
            weight_decay: 0.,
            ..Default::default()
        };
        let optimizer = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            optimizer,
            max_grad_norm,
            vars,
        })
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = match self.max_grad_norm {
            Some(max_norm) => clip_grad(loss, &self.vars, max_norm)?,
            None => loss.backward()?,
        };
        self.optimizer.step(&grads)
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.optimizer.set_learning_rate(learning_rate)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn clipping_bounds_the_global_norm() -> Result<()> {
        let device = Device::Cpu;
        let a = Var::from_tensor(&Tensor::new(&[3f32, 0.], &device)?)?;
        let b = Var::from_tensor(&Tensor::new(&[0f32, 4.], &device)?)?;
        // d/dx of 0.5 * x^2 is x, so the raw gradient norm is 5
        let loss = (a.as_tensor().sqr()?.sum_all()? + b.as_tensor().sqr()?.sum_all()?)?
            .affine(0.5, 0.)?;
        let grads = clip_grad(&loss, &[a.clone(), b.clone()], 1.)?;
        let norm: f32 = [&a, &b]
            .iter()
            .map(|v| {
                grads
                    .get(v.as_tensor())
                    .map(|g| g.sqr().and_then(|g| g.sum_all()).and_then(|g| g.to_scalar::<f32>()))
                    .unwrap_or(Ok(0.))
            })
            .sum::<Result<f32>>()?
            .sqrt();
        assert!((norm - 1.).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn step_moves_parameters_downhill() -> Result<()> {
        let device = Device::Cpu;
        let x = Var::zeros(1, DType::F32, &device)?;
        let mut optimizer = OptimizerWithMaxGrad::adam(vec![x.clone()], 0.1, Some(0.5))?;
        for _ in 0..10 {
            let loss = (x.as_tensor() - 1.)?.sqr()?.sum_all()?;
            optimizer.backward_step(&loss)?;
        }
        let value = x.as_tensor().to_vec1::<f32>()?[0];
        assert!(value > 0.5);
        optimizer.set_learning_rate(1e-3);
        assert_eq!(optimizer.learning_rate(), 1e-3);
        Ok(())
    }
}
