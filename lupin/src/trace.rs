//! Traces of the open-universe mixture and the partition/merge pair.
//!
//! A batch never branches per element. Elements are partitioned once into
//! three homogeneous groups (`k = 1`, `k = 2, z = 0`, `k = 2, z = 1`), each
//! group remembers the batch positions it came from, and per-group results
//! are scattered back into batch order by those positions.

use crate::common::*;
use candle_util::candle_core::Result;

/// Number of sub-components in the `k = 2` branch
pub const NUM_MIXTURES: usize = 2;

/// Number of homogeneous groups a batch is split into
pub const NUM_GROUPS: usize = 1 + NUM_MIXTURES;

/// Which structural alternative a trace took
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Branch {
    /// `k = 1`: a single latent `x1`
    Single,
    /// `k = 2` with sub-component `z`: a single latent `x2`
    Mixture(usize),
}

impl Branch {
    /// All groups in their canonical (slot) order
    pub const ALL: [Branch; NUM_GROUPS] = [Branch::Single, Branch::Mixture(0), Branch::Mixture(1)];

    /// The value of the top-level choice `k` (1 or 2)
    pub fn k(self) -> usize {
        match self {
            Branch::Single => 1,
            Branch::Mixture(_) => 2,
        }
    }

    /// Zero-based column of `k` in a branch probability vector
    pub fn k_index(self) -> usize {
        self.k() - 1
    }

    pub fn z(self) -> Option<usize> {
        match self {
            Branch::Single => None,
            Branch::Mixture(z) => Some(z),
        }
    }

    /// Position of this branch's group inside a batch
    pub fn slot(self) -> usize {
        match self {
            Branch::Single => 0,
            Branch::Mixture(z) => {
                debug_assert!(z < NUM_MIXTURES);
                1 + z
            }
        }
    }
}

/// One fully specified sample: discrete choices, latent, observation
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Trace {
    Single { x1: f32, obs: f32 },
    Mixture { z: usize, x2: f32, obs: f32 },
}

impl Trace {
    fn from_parts(branch: Branch, latent: f32, obs: f32) -> Self {
        match branch {
            Branch::Single => Trace::Single { x1: latent, obs },
            Branch::Mixture(z) => Trace::Mixture { z, x2: latent, obs },
        }
    }

    pub fn branch(&self) -> Branch {
        match self {
            Trace::Single { .. } => Branch::Single,
            Trace::Mixture { z, .. } => Branch::Mixture(*z),
        }
    }

    pub fn latent(&self) -> f32 {
        match self {
            Trace::Single { x1, .. } => *x1,
            Trace::Mixture { x2, .. } => *x2,
        }
    }

    pub fn obs(&self) -> f32 {
        match self {
            Trace::Single { obs, .. } | Trace::Mixture { obs, .. } => *obs,
        }
    }
}

/// Split `index` into `num_labels` sub-lists by the parallel `labels`,
/// preserving the relative order within each sub-list
pub fn split_by_label(index: &[usize], labels: &[usize], num_labels: usize) -> Vec<Vec<usize>> {
    debug_assert_eq!(index.len(), labels.len());
    let mut out = vec![Vec::new(); num_labels];
    for (&i, &l) in index.iter().zip(labels.iter()) {
        out[l].push(i);
    }
    out
}

/// Batch positions as a `u32` index tensor for `index_select`
pub fn index_tensor(index: &[usize], device: &Device) -> Result<Tensor> {
    let ids: Vec<u32> = index.iter().map(|&i| i as u32).collect();
    Tensor::from_vec(ids, index.len(), device)
}

/// Parallel per-element fields of one non-empty group
#[derive(Clone, Debug)]
pub struct GroupValues {
    /// `x1` or `x2`, shape (n,)
    pub latent: Tensor,
    /// observation, shape (n,)
    pub obs: Tensor,
}

/// All elements of a batch that took the same branch
#[derive(Clone, Debug)]
pub struct TraceGroup {
    pub branch: Branch,
    /// batch positions, in draw order
    pub index: Vec<usize>,
    /// `None` exactly when the group is empty
    pub values: Option<GroupValues>,
}

impl TraceGroup {
    pub fn empty(branch: Branch) -> Self {
        Self {
            branch,
            index: vec![],
            values: None,
        }
    }

    pub fn new(branch: Branch, index: Vec<usize>, latent: Tensor, obs: Tensor) -> Result<Self> {
        if index.is_empty() {
            return Ok(Self::empty(branch));
        }
        let n = index.len();
        if latent.dims1()? != n || obs.dims1()? != n {
            candle_core::bail!(
                "group {:?}: {} positions but latent {:?} and obs {:?}",
                branch,
                n,
                latent.dims(),
                obs.dims()
            );
        }
        Ok(Self {
            branch,
            index,
            values: Some(GroupValues { latent, obs }),
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn latent(&self) -> Option<&Tensor> {
        self.values.as_ref().map(|v| &v.latent)
    }

    pub fn obs(&self) -> Option<&Tensor> {
        self.values.as_ref().map(|v| &v.obs)
    }

    /// Same values cut out of the autodiff graph
    pub fn detach(&self) -> Self {
        Self {
            branch: self.branch,
            index: self.index.clone(),
            values: self.values.as_ref().map(|v| GroupValues {
                latent: v.latent.detach(),
                obs: v.obs.detach(),
            }),
        }
    }
}

/// One optional tensor per group. `None` stands for the additive identity
/// contributed by an empty group.
#[derive(Clone, Debug, Default)]
pub struct GroupTensors {
    slots: [Option<Tensor>; NUM_GROUPS],
}

impl GroupTensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, branch: Branch, value: Tensor) {
        self.slots[branch.slot()] = Some(value);
    }

    pub fn get(&self, branch: Branch) -> Option<&Tensor> {
        self.slots[branch.slot()].as_ref()
    }

    pub fn add(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a + b, |b| Ok(b.clone()))
    }

    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a - b, |b| b.neg())
    }

    pub fn detach(&self) -> Self {
        let mut out = Self::new();
        for (dst, src) in out.slots.iter_mut().zip(self.slots.iter()) {
            *dst = src.as_ref().map(|t| t.detach());
        }
        out
    }

    fn zip_with<F, G>(&self, other: &Self, both: F, right_only: G) -> Result<Self>
    where
        F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
        G: Fn(&Tensor) -> Result<Tensor>,
    {
        let mut out = Self::new();
        for (s, (a, b)) in self.slots.iter().zip(other.slots.iter()).enumerate() {
            out.slots[s] = match (a, b) {
                (Some(a), Some(b)) => Some(both(a, b)?),
                (Some(a), None) => Some(a.clone()),
                (None, Some(b)) => Some(right_only(b)?),
                (None, None) => None,
            };
        }
        Ok(out)
    }
}

/// A batch of traces held as three disjoint groups
#[derive(Clone, Debug)]
pub struct TraceBatch {
    len: usize,
    groups: [TraceGroup; NUM_GROUPS],
}

impl TraceBatch {
    /// Assemble a batch of `len` elements; the groups must be given in
    /// slot order and their sizes must add up to `len`
    pub fn new(len: usize, groups: [TraceGroup; NUM_GROUPS]) -> Result<Self> {
        for (slot, g) in groups.iter().enumerate() {
            if g.branch.slot() != slot {
                candle_core::bail!("group {:?} placed at slot {}", g.branch, slot);
            }
        }
        let total: usize = groups.iter().map(|g| g.len()).sum();
        if total != len {
            candle_core::bail!("groups hold {} elements, batch has {}", total, len);
        }
        Ok(Self { len, groups })
    }

    pub fn empty() -> Self {
        Self {
            len: 0,
            groups: Branch::ALL.map(TraceGroup::empty),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn group(&self, branch: Branch) -> &TraceGroup {
        &self.groups[branch.slot()]
    }

    pub fn groups(&self) -> &[TraceGroup] {
        &self.groups
    }

    pub fn detach(&self) -> Self {
        Self {
            len: self.len,
            groups: std::array::from_fn(|s| self.groups[s].detach()),
        }
    }

    /// Which branch each batch element took
    pub fn branches(&self) -> Vec<Branch> {
        let mut out = vec![Branch::Single; self.len];
        for g in self.groups.iter() {
            for &i in g.index.iter() {
                out[i] = g.branch;
            }
        }
        out
    }

    /// Share of the batch in each group, in slot order
    pub fn branch_frequencies(&self) -> [f64; NUM_GROUPS] {
        let mut counts = [0usize; NUM_GROUPS];
        for branch in self.branches() {
            counts[branch.slot()] += 1;
        }
        let n = self.len.max(1) as f64;
        counts.map(|c| c as f64 / n)
    }

    /// For each batch position, where it sits in the concatenation of the
    /// non-empty groups (slot order). Fails unless every position is covered
    /// by exactly one group.
    fn gather_positions(&self, order: &[usize]) -> Result<Vec<u32>> {
        if order.len() != self.len {
            candle_core::bail!(
                "groups cover {} of {} batch positions",
                order.len(),
                self.len
            );
        }
        let mut inverse = vec![u32::MAX; self.len];
        for (pos, &i) in order.iter().enumerate() {
            if i >= self.len || inverse[i] != u32::MAX {
                candle_core::bail!("batch position {} is claimed twice or out of range", i);
            }
            inverse[i] = pos as u32;
        }
        Ok(inverse)
    }

    /// Scatter per-group vectors back into batch order, shape (len,)
    ///
    /// The values must be present exactly for the non-empty groups. A batch
    /// that would come out empty is an invariant violation, not a zero.
    pub fn merge(&self, values: &GroupTensors) -> Result<Tensor> {
        if self.len == 0 {
            candle_core::bail!("cannot merge an empty batch");
        }
        let mut parts: Vec<&Tensor> = Vec::with_capacity(NUM_GROUPS);
        let mut order: Vec<usize> = Vec::with_capacity(self.len);
        for g in self.groups.iter() {
            match (g.is_empty(), values.get(g.branch)) {
                (true, None) => {}
                (false, Some(v)) => {
                    if v.dims1()? != g.len() {
                        candle_core::bail!(
                            "group {:?}: {} elements but {} values",
                            g.branch,
                            g.len(),
                            v.dims1()?
                        );
                    }
                    parts.push(v);
                    order.extend_from_slice(&g.index);
                }
                (true, Some(_)) => {
                    candle_core::bail!("empty group {:?} carries values", g.branch)
                }
                (false, None) => {
                    candle_core::bail!("group {:?} has {} elements but no values", g.branch, g.len())
                }
            }
        }
        let inverse = self.gather_positions(&order)?;
        let stacked = Tensor::cat(&parts, 0)?;
        let ids = Tensor::from_vec(inverse, self.len, stacked.device())?;
        stacked.index_select(&ids, 0)
    }

    /// Observations in batch order
    pub fn obs(&self) -> Result<Tensor> {
        let mut values = GroupTensors::new();
        for g in self.groups.iter() {
            if let Some(obs) = g.obs() {
                values.set(g.branch, obs.clone());
            }
        }
        self.merge(&values)
    }

    /// Host copy of the batch as tagged traces, in batch order
    pub fn to_traces(&self) -> Result<Vec<Trace>> {
        let mut out: Vec<Option<Trace>> = vec![None; self.len];
        for g in self.groups.iter() {
            let Some(values) = g.values.as_ref() else {
                continue;
            };
            let latent = values.latent.to_vec1::<f32>()?;
            let obs = values.obs.to_vec1::<f32>()?;
            for (j, &i) in g.index.iter().enumerate() {
                out[i] = Some(Trace::from_parts(g.branch, latent[j], obs[j]));
            }
        }
        out.into_iter()
            .enumerate()
            .map(|(i, t)| t.ok_or_else(|| candle_core::Error::Msg(format!("no trace at {}", i))))
            .collect()
    }

    /// Partition tagged traces into groups
    #[cfg(test)]
    pub fn from_traces(traces: &[Trace], device: &Device) -> Result<Self> {
        let mut groups = Branch::ALL.map(TraceGroup::empty);
        for (slot, branch) in Branch::ALL.iter().enumerate() {
            let index: Vec<usize> = traces
                .iter()
                .enumerate()
                .filter(|(_, t)| t.branch() == *branch)
                .map(|(i, _)| i)
                .collect();
            if index.is_empty() {
                continue;
            }
            let latent: Vec<f32> = index.iter().map(|&i| traces[i].latent()).collect();
            let obs: Vec<f32> = index.iter().map(|&i| traces[i].obs()).collect();
            let n = index.len();
            groups[slot] = TraceGroup::new(
                *branch,
                index,
                Tensor::from_vec(latent, n, device)?,
                Tensor::from_vec(obs, n, device)?,
            )?;
        }
        Self::new(traces.len(), groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_traces(n: usize, rng: &mut StdRng) -> Vec<Trace> {
        (0..n)
            .map(|_| {
                let latent = rng.random::<f32>() * 10.0 - 5.0;
                let obs = rng.random::<f32>() * 10.0 - 5.0;
                if rng.random::<f32>() < 0.4 {
                    Trace::Single { x1: latent, obs }
                } else {
                    Trace::Mixture {
                        z: rng.random_range(0..NUM_MIXTURES),
                        x2: latent,
                        obs,
                    }
                }
            })
            .collect()
    }

    #[test]
    fn partition_merge_round_trip() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        for n in [0usize, 1, 2, 5, 17, 64] {
            for _ in 0..10 {
                let traces = random_traces(n, &mut rng);
                let batch = TraceBatch::from_traces(&traces, &Device::Cpu)?;
                assert_eq!(batch.len(), n);
                assert_eq!(batch.to_traces()?, traces);
                let branches: Vec<Branch> = traces.iter().map(|t| t.branch()).collect();
                assert_eq!(batch.branches(), branches);
            }
        }
        Ok(())
    }

    #[test]
    fn frequencies_count_each_group() -> Result<()> {
        let traces = vec![
            Trace::Single { x1: 0.0, obs: 0.0 },
            Trace::Mixture { z: 1, x2: 0.0, obs: 0.0 },
            Trace::Single { x1: 0.0, obs: 0.0 },
            Trace::Mixture { z: 1, x2: 0.0, obs: 0.0 },
        ];
        let batch = TraceBatch::from_traces(&traces, &Device::Cpu)?;
        assert_eq!(batch.branch_frequencies(), [0.5, 0.0, 0.5]);
        assert_eq!(TraceBatch::empty().branch_frequencies(), [0.0; NUM_GROUPS]);
        Ok(())
    }

    #[test]
    fn merge_restores_batch_order() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let traces = random_traces(30, &mut rng);
        let batch = TraceBatch::from_traces(&traces, &Device::Cpu)?;

        let mut values = GroupTensors::new();
        for g in batch.groups() {
            if !g.is_empty() {
                let v: Vec<f32> = g.index.iter().map(|&i| i as f32).collect();
                values.set(g.branch, Tensor::from_vec(v, g.len(), &Device::Cpu)?);
            }
        }
        let merged = batch.merge(&values)?.to_vec1::<f32>()?;
        let expected: Vec<f32> = (0..30).map(|i| i as f32).collect();
        assert_eq!(merged, expected);

        let obs = batch.obs()?.to_vec1::<f32>()?;
        let expected_obs: Vec<f32> = traces.iter().map(|t| t.obs()).collect();
        assert_eq!(obs, expected_obs);
        Ok(())
    }

    #[test]
    fn single_branch_batch() -> Result<()> {
        let traces = vec![Trace::Single { x1: 0.5, obs: 1.0 }; 4];
        let batch = TraceBatch::from_traces(&traces, &Device::Cpu)?;
        assert!(batch.group(Branch::Mixture(0)).is_empty());
        assert!(batch.group(Branch::Mixture(1)).is_empty());
        assert_eq!(batch.obs()?.to_vec1::<f32>()?, vec![1.0; 4]);
        Ok(())
    }

    #[test]
    fn merge_rejects_mismatched_groups() -> Result<()> {
        let traces = vec![
            Trace::Single { x1: 0.0, obs: 0.0 },
            Trace::Mixture { z: 1, x2: 0.0, obs: 0.0 },
        ];
        let batch = TraceBatch::from_traces(&traces, &Device::Cpu)?;

        let mut values = GroupTensors::new();
        values.set(Branch::Single, Tensor::new(&[1f32], &Device::Cpu)?);
        assert!(batch.merge(&values).is_err());

        values.set(Branch::Mixture(0), Tensor::new(&[2f32], &Device::Cpu)?);
        assert!(batch.merge(&values).is_err());

        assert!(TraceBatch::empty().merge(&GroupTensors::new()).is_err());
        Ok(())
    }

    #[test]
    fn empty_group_is_additive_identity() -> Result<()> {
        let dev = Device::Cpu;
        let mut a = GroupTensors::new();
        a.set(Branch::Single, Tensor::new(&[1f32, 2.0], &dev)?);
        let mut b = GroupTensors::new();
        b.set(Branch::Mixture(1), Tensor::new(&[3f32], &dev)?);

        let sum = a.add(&b)?;
        assert_eq!(sum.get(Branch::Single).unwrap().to_vec1::<f32>()?, vec![1.0, 2.0]);
        assert_eq!(sum.get(Branch::Mixture(1)).unwrap().to_vec1::<f32>()?, vec![3.0]);
        assert!(sum.get(Branch::Mixture(0)).is_none());

        let diff = a.sub(&b)?;
        assert_eq!(diff.get(Branch::Mixture(1)).unwrap().to_vec1::<f32>()?, vec![-3.0]);
        Ok(())
    }

    #[test]
    fn split_keeps_relative_order() {
        let parts = split_by_label(&[4, 9, 2, 7], &[1, 0, 1, 1], 2);
        assert_eq!(parts, vec![vec![9], vec![4, 2, 7]]);
    }
}
