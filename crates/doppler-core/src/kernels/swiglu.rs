//! swiglu / gated-silu FFN activation (spec §4.6, §4.8 step 7).
//!
//! `F = act(Gate) ⊙ Up`. `act` is `SiLU` by default (`swiglu`) but the
//! manifest may declare `gelu`/`relu` instead; all three share this gate.

use crate::error::Result;
use crate::kernels::{require_shape, Tensor};
use crate::manifest::ActivationKind;

fn activate(x: f32, kind: ActivationKind) -> f32 {
    match kind {
        ActivationKind::Silu => x / (1.0 + (-x).exp()),
        ActivationKind::Gelu => {
            0.5 * x * (1.0 + ((2.0 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x.powi(3))).tanh())
        }
        ActivationKind::Relu => x.max(0.0),
    }
}

pub fn gated_activation(gate: &Tensor, up: &Tensor, kind: ActivationKind) -> Result<Tensor> {
    require_shape("gated_activation", &up.shape, &gate.shape)?;
    let data: Vec<f32> = gate
        .data
        .iter()
        .zip(up.data.iter())
        .map(|(&g, &u)| activate(g, kind) * u)
        .collect();
    Tensor::new(gate.shape.clone(), data)
}

/// Accumulates `contribution` into `acc` in place, per-element. Used for
/// MoE output accumulation (spec §4.6's "scatter-add").
pub fn scatter_add(acc: &mut Tensor, contribution: &Tensor, weight: f32) -> Result<()> {
    require_shape("scatter_add", &contribution.shape, &acc.shape)?;
    for (a, c) in acc.data.iter_mut().zip(contribution.data.iter()) {
        *a += weight * c;
    }
    Ok(())
}
