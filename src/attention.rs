// src/attention.rs
use anyhow::{bail, Result};
use tch::{nn, nn::Module, Kind, Tensor};

/// Luong attention scoring policy, resolved once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttnMethod {
    Dot,
    General,
    Concat,
}

impl AttnMethod {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "dot" => Ok(Self::Dot),
            "general" => Ok(Self::General),
            "concat" => Ok(Self::Concat),
            other => bail!(
                "{other} is not an appropriate attention method (expected dot, general or concat)"
            ),
        }
    }
}

/// Each variant carries only the parameters its scoring function needs.
enum AttnScore {
    Dot,
    General { attn: nn::Linear },
    Concat { attn: nn::Linear, v: Tensor },
}

/// Global attention over encoder outputs.
pub struct Attn {
    score: AttnScore,
}

impl Attn {
    pub fn new(p: &nn::Path, method: AttnMethod, hidden_size: i64) -> Self {
        let score = match method {
            AttnMethod::Dot => AttnScore::Dot,
            AttnMethod::General => AttnScore::General {
                attn: nn::linear(p / "attn", hidden_size, hidden_size, Default::default()),
            },
            AttnMethod::Concat => AttnScore::Concat {
                attn: nn::linear(p / "attn", hidden_size * 2, hidden_size, Default::default()),
                v: p.var("v", &[hidden_size], nn::Init::Uniform { lo: -0.1, up: 0.1 }),
            },
        };
        Self { score }
    }

    /// hidden: `[1, B, H]` (current decoder step), encoder_outputs: `[T, B, H]`.
    /// Returns softmax attention weights `[B, 1, T]`, ready to `bmm` against the
    /// batch-major encoder outputs.
    pub fn forward(&self, hidden: &Tensor, encoder_outputs: &Tensor) -> Tensor {
        let energies = match &self.score {
            AttnScore::Dot => {
                (hidden * encoder_outputs).sum_dim_intlist(&[2i64][..], false, Kind::Float)
            }
            AttnScore::General { attn } => {
                let energy = attn.forward(encoder_outputs);
                (hidden * energy).sum_dim_intlist(&[2i64][..], false, Kind::Float)
            }
            AttnScore::Concat { attn, v } => {
                let src_len = encoder_outputs.size()[0];
                let expanded = hidden.expand([src_len, -1, -1], false);
                let energy = attn
                    .forward(&Tensor::cat(&[expanded, encoder_outputs.shallow_clone()], 2))
                    .tanh();
                (v * energy).sum_dim_intlist(&[2i64][..], false, Kind::Float)
            }
        };

        // [T, B] -> [B, T], normalize over source positions, add the bmm dim.
        energies
            .transpose(0, 1)
            .softmax(1, Kind::Float)
            .unsqueeze(1)
    }
}
