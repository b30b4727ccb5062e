// src/optim.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Tensor};

pub const ADAM_STATE_VERSION: u32 = 1;

/// Adam over an explicit, name-sorted parameter group.
///
/// tch's bundled optimizer keeps its moments opaque, which rules out exact
/// checkpoint resume; this one owns its state and can snapshot/restore it.
/// Encoder and decoder each get their own instance so gradient clipping and
/// the learning rate stay independent per group.
pub struct Adam {
    params: Vec<(String, Tensor)>,
    moments: Vec<(Tensor, Tensor)>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step_count: i64,
}

impl Adam {
    pub fn new(mut params: Vec<(String, Tensor)>, lr: f64) -> Self {
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let moments = params
            .iter()
            .map(|(_, p)| (Tensor::zeros_like(p), Tensor::zeros_like(p)))
            .collect();
        Self {
            params,
            moments,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step_count: 0,
        }
    }

    pub fn zero_grad(&mut self) {
        for (_, p) in &mut self.params {
            p.zero_grad();
        }
    }

    /// Scale this group's gradients so their global norm does not exceed
    /// `max_norm`. Returns the pre-clip norm.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        tch::no_grad(|| {
            let mut total_sq = 0f64;
            for (_, p) in &self.params {
                let g = p.grad();
                if g.defined() {
                    let n = g.norm().double_value(&[]);
                    total_sq += n * n;
                }
            }
            let total = total_sq.sqrt();
            if total > max_norm {
                let coef = max_norm / (total + 1e-6);
                for (_, p) in &mut self.params {
                    let mut g = p.grad();
                    if g.defined() {
                        let scaled = &g * coef;
                        g.copy_(&scaled);
                    }
                }
            }
            total
        })
    }

    pub fn step(&mut self) {
        self.step_count += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let bc2 = 1.0 - self.beta2.powi(self.step_count as i32);
        tch::no_grad(|| {
            for ((_, p), (m, v)) in self.params.iter_mut().zip(self.moments.iter_mut()) {
                let g = p.grad();
                if !g.defined() {
                    continue;
                }
                let m_new = &*m * self.beta1 + &g * (1.0 - self.beta1);
                m.copy_(&m_new);
                let v_new = &*v * self.beta2 + (&g * &g) * (1.0 - self.beta2);
                v.copy_(&v_new);

                let denom = (&*v / bc2).sqrt() + self.eps;
                let update = (&*m / bc1) * self.lr / &denom;
                let p_new = &*p - &update;
                p.copy_(&p_new);
            }
        });
    }

    pub fn step_count(&self) -> i64 {
        self.step_count
    }

    pub fn state(&self) -> Result<AdamState> {
        let mut moments = Vec::with_capacity(self.params.len());
        for ((name, p), (m, v)) in self.params.iter().zip(&self.moments) {
            moments.push(MomentEntry {
                name: name.clone(),
                shape: p.size(),
                m: tensor_to_vec(m)?,
                v: tensor_to_vec(v)?,
            });
        }
        Ok(AdamState {
            version: ADAM_STATE_VERSION,
            step_count: self.step_count,
            moments,
        })
    }

    pub fn load_state(&mut self, state: &AdamState) -> Result<()> {
        if state.version != ADAM_STATE_VERSION {
            bail!(
                "unsupported optimizer state version {} (expected {})",
                state.version,
                ADAM_STATE_VERSION
            );
        }
        if state.moments.len() != self.params.len() {
            bail!(
                "optimizer state has {} moment buffers for {} parameters",
                state.moments.len(),
                self.params.len()
            );
        }
        tch::no_grad(|| -> Result<()> {
            for (entry, ((name, p), (m, v))) in state
                .moments
                .iter()
                .zip(self.params.iter().zip(self.moments.iter_mut()))
            {
                if &entry.name != name {
                    bail!("optimizer state names {} but this group holds {}", entry.name, name);
                }
                if entry.shape != p.size() {
                    bail!(
                        "optimizer state for {} has shape {:?}, parameter is {:?}",
                        name,
                        entry.shape,
                        p.size()
                    );
                }
                m.copy_(&vec_to_tensor(&entry.m, &entry.shape, p.device()));
                v.copy_(&vec_to_tensor(&entry.v, &entry.shape, p.device()));
            }
            Ok(())
        })?;
        self.step_count = state.step_count;
        Ok(())
    }
}

/// Name-sorted trainable variables of a VarStore whose path starts with one of
/// the given prefixes.
pub fn named_parameters(vs: &nn::VarStore, prefixes: &[&str]) -> Vec<(String, Tensor)> {
    let mut params: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .filter(|(name, _)| prefixes.iter().any(|p| name.starts_with(p)))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}

pub fn tensor_to_vec(t: &Tensor) -> Result<Vec<f32>> {
    let flat = t.reshape([-1]).to_device(Device::Cpu);
    Ok(Vec::<f32>::try_from(&flat)?)
}

pub fn vec_to_tensor(data: &[f32], shape: &[i64], device: Device) -> Tensor {
    Tensor::from_slice(data).reshape(shape).to_device(device)
}

/// Serializable Adam snapshot stored inside checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamState {
    pub version: u32,
    pub step_count: i64,
    pub moments: Vec<MomentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentEntry {
    pub name: String,
    pub shape: Vec<i64>,
    pub m: Vec<f32>,
    pub v: Vec<f32>,
}
