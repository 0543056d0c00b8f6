//! Amortized proposal q_φ(k, z, x | obs)
//!
//! Six small tanh networks, each fed only the group it is defined for:
//!
//! ```text
//! obs            -> k logits         obs            -> z logits
//! obs            -> x1 mean          [obs, onehot z] -> x2 mean
//! obs            -> x1 log std       [obs, onehot z] -> x2 log std
//! ```

use crate::common::*;
use crate::trace::*;

use candle_util::candle_core::Result;
use candle_util::candle_nn::{ops, Linear, Module};
use candle_util::candle_aux_layers::{tanh_mlp, StackLayers};
use candle_util::candle_loss_functions::{categorical_log_prob, gaussian_log_density};
use candle_util::candle_sampling::{one_hot_rows, sample_categorical_rows, standard_normal};

const HIDDEN: [usize; 2] = [8, 8];
const MIN_LOG_STD: f64 = -8.;
const MAX_LOG_STD: f64 = 8.;

pub struct InferenceNetwork {
    k_logits: StackLayers<Linear>,
    z_logits: StackLayers<Linear>,
    x1_mean: StackLayers<Linear>,
    x1_log_std: StackLayers<Linear>,
    x2_mean: StackLayers<Linear>,
    x2_log_std: StackLayers<Linear>,
    device: Device,
}

/// log q split by the kind of choice it scores
#[derive(Clone, Debug)]
pub struct ProposalLogProb {
    /// log q(k | obs) + log q(z | obs) per element
    pub discrete: GroupTensors,
    /// log q(x | obs, z) per element
    pub continuous: GroupTensors,
}

impl ProposalLogProb {
    pub fn total(&self) -> Result<GroupTensors> {
        self.discrete.add(&self.continuous)
    }
}

impl InferenceNetwork {
    /// Will create these variables under `vb`:
    ///
    /// * `k.*`, `z.*` for the discrete choices
    /// * `x1.mean.*`, `x1.logstd.*`
    /// * `x2.mean.*`, `x2.logstd.*`, taking a one-hot `z` next to `obs`
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let x2_in = 1 + NUM_MIXTURES;
        Ok(Self {
            k_logits: tanh_mlp(1, &HIDDEN, 2, vb.pp("k"))?,
            z_logits: tanh_mlp(1, &HIDDEN, NUM_MIXTURES, vb.pp("z"))?,
            x1_mean: tanh_mlp(1, &HIDDEN, 1, vb.pp("x1.mean"))?,
            x1_log_std: tanh_mlp(1, &HIDDEN, 1, vb.pp("x1.logstd"))?,
            x2_mean: tanh_mlp(x2_in, &HIDDEN, 1, vb.pp("x2.mean"))?,
            x2_log_std: tanh_mlp(x2_in, &HIDDEN, 1, vb.pp("x2.logstd"))?,
            device: vb.device().clone(),
        })
    }

    /// Draw one trace per observation
    ///
    /// * `obs` - observations (n,)
    ///
    /// The latent is `mean + std * eps`, so it stays attached to φ; call
    /// `detach` on the result where a phase must not differentiate it.
    pub fn sample<R: Rng>(&self, obs: &Tensor, rng: &mut R) -> Result<TraceBatch> {
        let n = obs.dims1()?;
        if n == 0 {
            return Ok(TraceBatch::empty());
        }

        let k_probs = ops::softmax(&self.k_logits.forward(&obs.unsqueeze(1)?)?, 1)?;
        let k_index = sample_categorical_rows(&k_probs, rng)?;
        let everyone: Vec<usize> = (0..n).collect();
        let mut by_k = split_by_label(&everyone, &k_index, 2).into_iter();
        let single_index = by_k.next().unwrap_or_default();
        let mixture_index = by_k.next().unwrap_or_default();

        let z = if mixture_index.is_empty() {
            vec![]
        } else {
            let mixture_obs = obs.index_select(&index_tensor(&mixture_index, &self.device)?, 0)?;
            let z_probs = ops::softmax(&self.z_logits.forward(&mixture_obs.unsqueeze(1)?)?, 1)?;
            sample_categorical_rows(&z_probs, rng)?
        };
        let mut by_z = split_by_label(&mixture_index, &z, NUM_MIXTURES).into_iter();
        let index_0 = by_z.next().unwrap_or_default();
        let index_1 = by_z.next().unwrap_or_default();

        let single = self.sample_group(Branch::Single, single_index, obs, rng)?;
        let mix_0 = self.sample_group(Branch::Mixture(0), index_0, obs, rng)?;
        let mix_1 = self.sample_group(Branch::Mixture(1), index_1, obs, rng)?;

        TraceBatch::new(n, [single, mix_0, mix_1])
    }

    fn sample_group<R: Rng>(
        &self,
        branch: Branch,
        index: Vec<usize>,
        obs: &Tensor,
        rng: &mut R,
    ) -> Result<TraceGroup> {
        if index.is_empty() {
            return Ok(TraceGroup::empty(branch));
        }
        let obs_g = obs.index_select(&index_tensor(&index, &self.device)?, 0)?;
        let (mean, std) = self.latent_params(branch, &obs_g)?;
        let eps = standard_normal(index.len(), rng, &self.device)?;
        let latent = (mean + (std * eps)?)?;
        TraceGroup::new(branch, index, latent, obs_g)
    }

    /// Gaussian mean and scale of the group's latent, each (n,)
    fn latent_params(&self, branch: Branch, obs: &Tensor) -> Result<(Tensor, Tensor)> {
        let obs_n1 = obs.unsqueeze(1)?;
        let (input, mean_net, log_std_net) = match branch {
            Branch::Single => (obs_n1, &self.x1_mean, &self.x1_log_std),
            Branch::Mixture(z) => {
                let n = obs_n1.dim(0)?;
                let hot = one_hot_rows(n, NUM_MIXTURES, z, &self.device)?;
                let input = Tensor::cat(&[&obs_n1, &hot], 1)?;
                (input, &self.x2_mean, &self.x2_log_std)
            }
        };
        let mean = mean_net.forward(&input)?.squeeze(1)?;
        let std = log_std_net
            .forward(&input)?
            .clamp(MIN_LOG_STD, MAX_LOG_STD)?
            .exp()?
            .squeeze(1)?;
        Ok((mean, std))
    }

    /// log q_φ(trace | obs) per element of every non-empty group
    ///
    /// Works the same on attached or detached batches; attachment only
    /// decides what the backward pass reaches.
    pub fn log_density(&self, batch: &TraceBatch) -> Result<ProposalLogProb> {
        let mut discrete = GroupTensors::new();
        let mut continuous = GroupTensors::new();

        for g in batch.groups() {
            let Some(values) = g.values.as_ref() else {
                continue;
            };
            let obs_n1 = values.obs.unsqueeze(1)?;
            let log_k = categorical_log_prob(&self.k_logits.forward(&obs_n1)?, g.branch.k_index())?;
            let log_discrete = match g.branch.z() {
                Some(z) => (log_k + categorical_log_prob(&self.z_logits.forward(&obs_n1)?, z)?)?,
                None => log_k,
            };
            let (mean, std) = self.latent_params(g.branch, &values.obs)?;
            let log_x = gaussian_log_density(&values.latent, &mean, &std)?;

            discrete.set(g.branch, log_discrete);
            continuous.set(g.branch, log_x);
        }

        Ok(ProposalLogProb {
            discrete,
            continuous,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn network(varmap: &VarMap) -> Result<InferenceNetwork> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        InferenceNetwork::new(vb.pp("phi"))
    }

    #[test]
    fn sample_keeps_observations_in_order() -> Result<()> {
        let varmap = VarMap::new();
        let q = network(&varmap)?;
        let mut rng = StdRng::seed_from_u64(3);

        let obs_vec: Vec<f32> = (0..40).map(|i| i as f32 * 0.5 - 10.0).collect();
        let obs = Tensor::from_vec(obs_vec.clone(), 40, &Device::Cpu)?;
        let batch = q.sample(&obs, &mut rng)?;

        assert_eq!(batch.len(), 40);
        assert_eq!(batch.obs()?.to_vec1::<f32>()?, obs_vec);
        let total: usize = batch.groups().iter().map(|g| g.len()).sum();
        assert_eq!(total, 40);
        Ok(())
    }

    #[test]
    fn zero_observations() -> Result<()> {
        let varmap = VarMap::new();
        let q = network(&varmap)?;
        let mut rng = StdRng::seed_from_u64(0);
        let obs = Tensor::zeros(0, DType::F32, &Device::Cpu)?;
        let batch = q.sample(&obs, &mut rng)?;
        assert!(batch.is_empty());
        let lq = q.log_density(&batch)?;
        for b in Branch::ALL {
            assert!(lq.discrete.get(b).is_none());
            assert!(lq.continuous.get(b).is_none());
        }
        Ok(())
    }

    #[test]
    fn empty_groups_are_skipped() -> Result<()> {
        let varmap = VarMap::new();
        let q = network(&varmap)?;
        let traces = vec![
            Trace::Single { x1: 0.3, obs: 1.0 },
            Trace::Single { x1: -0.2, obs: -1.0 },
        ];
        let batch = TraceBatch::from_traces(&traces, &Device::Cpu)?;
        let lq = q.log_density(&batch)?;
        assert_eq!(lq.discrete.get(Branch::Single).unwrap().dims(), &[2]);
        assert!(lq.discrete.get(Branch::Mixture(0)).is_none());
        assert!(lq.continuous.get(Branch::Mixture(1)).is_none());
        assert_eq!(batch.merge(&lq.total()?)?.dims(), &[2]);
        Ok(())
    }

    #[test]
    fn discrete_choices_are_normalized() -> Result<()> {
        let varmap = VarMap::new();
        let q = network(&varmap)?;
        for &obs in &[-7.0f32, -1.0, 0.0, 2.5, 6.0] {
            let traces = vec![
                Trace::Single { x1: 0.0, obs },
                Trace::Mixture { z: 0, x2: 0.0, obs },
                Trace::Mixture { z: 1, x2: 0.0, obs },
            ];
            let batch = TraceBatch::from_traces(&traces, &Device::Cpu)?;
            let lq = q.log_density(&batch)?;
            let total: f32 = batch
                .merge(&lq.discrete)?
                .exp()?
                .sum_all()?
                .to_scalar::<f32>()?;
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn detaching_does_not_change_values() -> Result<()> {
        let varmap = VarMap::new();
        let q = network(&varmap)?;
        let mut rng = StdRng::seed_from_u64(19);
        let obs = Tensor::randn(0f32, 4f32, 64, &Device::Cpu)?;

        let batch = q.sample(&obs, &mut rng)?;
        let attached = batch.merge(&q.log_density(&batch)?.total()?)?;
        let detached = batch.merge(&q.log_density(&batch.detach())?.total()?)?;

        let a = attached.to_vec1::<f32>()?;
        let d = detached.to_vec1::<f32>()?;
        for (x, y) in a.iter().zip(d.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn latent_is_pathwise_in_phi() -> Result<()> {
        let varmap = VarMap::new();
        let q = network(&varmap)?;
        let mut rng = StdRng::seed_from_u64(23);
        let obs = Tensor::from_vec(vec![0.5f32; 16], 16, &Device::Cpu)?;
        let batch = q.sample(&obs, &mut rng)?;

        let mut latents = GroupTensors::new();
        for g in batch.groups() {
            if let Some(x) = g.latent() {
                latents.set(g.branch, x.clone());
            }
        }
        let grads = batch.merge(&latents)?.sum_all()?.backward()?;
        let touched = varmap
            .all_vars()
            .iter()
            .filter(|v| grads.get(v.as_tensor()).is_some())
            .count();
        assert!(touched > 0);
        Ok(())
    }
}
