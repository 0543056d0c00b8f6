use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// Hidden-layer activations; `candle_nn::Activation` has no plain tanh
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HiddenAct {
    Tanh,
}

impl Module for HiddenAct {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            HiddenAct::Tanh => x.tanh(),
        }
    }
}

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<HiddenAct>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: HiddenAct) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A fully connected tanh network `in_dim -> hidden... -> out_dim` with a
/// linear read-out
///
/// Creates these variables under `vb`:
/// * `fc.{j}.weight`, `fc.{j}.bias` for the j-th hidden layer
/// * `out.weight`, `out.bias`
///
/// # Arguments
/// * `in_dim` - input dimension
/// * `hidden` - hidden layer widths
/// * `out_dim` - output dimension
/// * `vb` - variable builder
pub fn tanh_mlp(
    in_dim: usize,
    hidden: &[usize],
    out_dim: usize,
    vb: VarBuilder,
) -> Result<StackLayers<Linear>> {
    let mut stack = StackLayers::<Linear>::new();
    let mut prev_dim = in_dim;
    for (j, &next_dim) in hidden.iter().enumerate() {
        let _name = format!("fc.{}", j);
        stack.push_with_act(
            candle_nn::linear(prev_dim, next_dim, vb.pp(_name))?,
            HiddenAct::Tanh,
        );
        prev_dim = next_dim;
    }
    stack.push(candle_nn::linear(prev_dim, out_dim, vb.pp("out"))?);
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn mlp_shapes_and_variables() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mlp = tanh_mlp(3, &[8, 8], 2, vb.pp("net"))?;

        let x = Tensor::randn(0f32, 1f32, (5, 3), &Device::Cpu)?;
        let y = mlp.forward(&x)?;
        assert_eq!(y.dims(), &[5, 2]);

        // 3 weights + 3 biases
        assert_eq!(varmap.all_vars().len(), 6);
        Ok(())
    }

    #[test]
    fn tanh_is_bounded() -> Result<()> {
        let x = Tensor::new(&[-50f32, 0.0, 50.0], &Device::Cpu)?;
        let y = HiddenAct::Tanh.forward(&x)?.to_vec1::<f32>()?;
        assert!(y.iter().all(|v| v.abs() <= 1.0));
        Ok(())
    }
}
