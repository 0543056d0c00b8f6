use crate::common::*;
use crate::generative::{GenerativeModel, GenerativeParams};
use crate::inference::InferenceNetwork;
use crate::trace::NUM_GROUPS;

use candle_util::candle_core::Result;

/// Generative model (θ) and proposal (φ) with separate parameter stores
pub struct ModelPair {
    pub theta: VarMap,
    pub phi: VarMap,
    pub generative: GenerativeModel,
    pub inference: InferenceNetwork,
    device: Device,
}

impl ModelPair {
    pub fn new(params: &GenerativeParams, device: &Device) -> Result<Self> {
        let theta = VarMap::new();
        let phi = VarMap::new();
        let generative =
            GenerativeModel::new(params, VarBuilder::from_varmap(&theta, DType::F32, device))?;
        let inference = InferenceNetwork::new(VarBuilder::from_varmap(&phi, DType::F32, device))?;
        Ok(Self {
            theta,
            phi,
            generative,
            inference,
            device: device.clone(),
        })
    }

    /// Write `{prefix}.theta.safetensors` and `{prefix}.phi.safetensors`
    pub fn save(&self, prefix: &str) -> Result<()> {
        let theta_file = format!("{}.theta.safetensors", prefix);
        let phi_file = format!("{}.phi.safetensors", prefix);
        self.theta.save(&theta_file)?;
        self.phi.save(&phi_file)?;
        info!("saved parameters: {}, {}", theta_file, phi_file);
        Ok(())
    }

    /// Monte Carlo estimate of q(k, z | obs) at each query observation
    ///
    /// * `query_obs` - observations to condition on
    /// * `num_samples` - proposal draws per observation
    ///
    /// Returns one row per observation, columns in group order
    /// (`k = 1`, `k = 2, z = 0`, `k = 2, z = 1`).
    pub fn summarize_proposal<R: Rng>(
        &self,
        query_obs: &[f64],
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Vec<[f64; NUM_GROUPS]>> {
        let mut out = Vec::with_capacity(query_obs.len());
        for &y in query_obs {
            let obs = Tensor::full(y as f32, num_samples, &self.device)?;
            let draws = self.inference.sample(&obs, rng)?.detach();
            let freq = draws.branch_frequencies();
            info!(
                "q(. | obs = {:.2}): k=1 {:.3}, k=2,z=0 {:.3}, k=2,z=1 {:.3}",
                y, freq[0], freq[1], freq[2]
            );
            if log::log_enabled!(log::Level::Debug) && !draws.is_empty() {
                let traces = draws.to_traces()?;
                debug!("first draws: {:?}", &traces[..traces.len().min(3)]);
            }
            out.push(freq);
        }
        Ok(out)
    }
}
