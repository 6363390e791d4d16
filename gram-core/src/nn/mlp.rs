use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear};
use either::Either;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    #[default]
    Elu,
    Relu,
    Tanh,
}

impl Module for ActivationKind {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Elu => xs.elu(1.),
            Self::Relu => xs.relu(),
            Self::Tanh => xs.tanh(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Layer(pub Either<Linear, ActivationKind>);

impl Module for Layer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match &self.0 {
            Either::Left(linear) => linear.forward(xs),
            Either::Right(activation) => activation.forward(xs),
        }
    }
}

/// Multi-layer perceptron with an activation between hidden layers and a linear output.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Layer>,
    input_dim: usize,
    output_dim: usize,
}

impl Mlp {
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?
        }
        Ok(xs)
    }
}

pub fn build_mlp(
    input_dim: usize,
    hidden_layers: &[usize],
    output_dim: usize,
    activation: ActivationKind,
    vb: &VarBuilder,
    prefix: &str,
) -> Result<Mlp> {
    let mut last_dim = input_dim;
    let mut layers = vec![];
    for (layer_idx, layer_size) in hidden_layers.iter().enumerate() {
        let layer = linear(last_dim, *layer_size, vb.pp(format!("{prefix}{layer_idx}")))?;
        layers.push(Layer(Either::Left(layer)));
        layers.push(Layer(Either::Right(activation)));
        last_dim = *layer_size;
    }
    let output = linear(
        last_dim,
        output_dim,
        vb.pp(format!("{prefix}{}", hidden_layers.len())),
    )?;
    layers.push(Layer(Either::Left(output)));
    Ok(Mlp {
        layers,
        input_dim,
        output_dim,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn activations_apply_elementwise() -> Result<()> {
        let xs = Tensor::new(&[-2f32, 0., 3.], &Device::Cpu)?;
        let tanh = ActivationKind::Tanh.forward(&xs)?.to_vec1::<f32>()?;
        assert!((tanh[0] + 2f32.tanh()).abs() < 1e-6);
        assert_eq!(tanh[1], 0.);
        assert!((tanh[2] - 3f32.tanh()).abs() < 1e-6);
        assert_eq!(ActivationKind::Relu.forward(&xs)?.to_vec1::<f32>()?, [0., 0., 3.]);
        let elu = ActivationKind::Elu.forward(&xs)?.to_vec1::<f32>()?;
        assert!((elu[0] - ((-2f32).exp() - 1.)).abs() < 1e-6);
        assert_eq!(elu[2], 3.);
        Ok(())
    }

    #[test]
    fn tanh_network_is_bounded_before_the_output_layer() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mlp = build_mlp(3, &[8, 4], 2, ActivationKind::Tanh, &vb, "layer")?;
        assert_eq!((mlp.input_dim(), mlp.output_dim()), (3, 2));
        let xs = (Tensor::ones((5, 3), DType::F32, &Device::Cpu)? * 100.)?;
        let hidden = mlp.layers[..4]
            .iter()
            .try_fold(xs.clone(), |xs, layer| layer.forward(&xs))?;
        let max = hidden.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max <= 1.);
        assert_eq!(mlp.forward(&xs)?.dims(), &[5, 2]);
        Ok(())
    }
}
