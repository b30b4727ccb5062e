// src/model.rs
use tch::{nn, nn::Module, Kind, Tensor};

use crate::attention::{Attn, AttnMethod};

/// One embedding table shared by encoder and decoder. Handles are shallow
/// clones of the same storage, so an optimizer step through either side is
/// visible to both.
pub struct SharedEmbedding {
    ws: Tensor,
}

impl SharedEmbedding {
    pub fn new(p: &nn::Path, num_embeddings: i64, embedding_dim: i64) -> Self {
        let ws = p.var(
            "ws",
            &[num_embeddings, embedding_dim],
            nn::Init::Randn { mean: 0.0, stdev: 1.0 },
        );
        Self { ws }
    }

    pub fn share(&self) -> Self {
        Self { ws: self.ws.shallow_clone() }
    }

    /// indices: any integer tensor; returns the same shape with a trailing
    /// embedding dimension appended.
    pub fn forward(&self, indices: &Tensor) -> Tensor {
        Tensor::embedding(&self.ws, indices, -1, false, false)
    }

    pub fn num_embeddings(&self) -> i64 {
        self.ws.size()[0]
    }
}

/// Single GRU cell: input and hidden projections to the three gates,
/// PyTorch gate order (reset, update, candidate).
struct GruCell {
    x2h: nn::Linear,
    h2h: nn::Linear,
}

impl GruCell {
    fn new(p: &nn::Path, input_dim: i64, hidden_size: i64) -> Self {
        Self {
            x2h: nn::linear(p / "x2h", input_dim, hidden_size * 3, Default::default()),
            h2h: nn::linear(p / "h2h", hidden_size, hidden_size * 3, Default::default()),
        }
    }

    /// x: `[B, input_dim]`, h: `[B, H]` -> new hidden `[B, H]`.
    fn step(&self, x: &Tensor, h: &Tensor) -> Tensor {
        let gx = self.x2h.forward(x).chunk(3, 1);
        let gh = self.h2h.forward(h).chunk(3, 1);
        let r = (&gx[0] + &gh[0]).sigmoid();
        let z = (&gx[1] + &gh[1]).sigmoid();
        let n = (&gx[2] + r * &gh[2]).tanh();
        // h' = (1 - z) * n + z * h
        &n + z * (h - &n)
    }
}

/// Bidirectional multi-layer GRU encoder.
///
/// Runs an explicit per-timestep loop with a validity mask derived from the
/// descending-sorted lengths, reproducing packed-sequence semantics: the
/// forward hidden state freezes once a sequence ends, the backward hidden
/// state stays zero across the padded tail, and outputs at padded positions
/// are zero. Forward and backward outputs are summed, so the output width is
/// `hidden_size`, not double.
pub struct EncoderRnn {
    embedding: SharedEmbedding,
    fwd: Vec<GruCell>,
    bwd: Vec<GruCell>,
    n_layers: i64,
    hidden_size: i64,
    dropout: f64,
}

impl EncoderRnn {
    pub fn new(
        p: &nn::Path,
        embedding: SharedEmbedding,
        hidden_size: i64,
        n_layers: i64,
        dropout: f64,
    ) -> Self {
        assert!(n_layers >= 1, "encoder needs at least one layer");
        let mut fwd = Vec::with_capacity(n_layers as usize);
        let mut bwd = Vec::with_capacity(n_layers as usize);
        for layer in 0..n_layers {
            // Upper layers consume the concatenated directions of the layer below.
            let input_dim = if layer == 0 { hidden_size } else { hidden_size * 2 };
            fwd.push(GruCell::new(&(p / format!("fwd{layer}")), input_dim, hidden_size));
            bwd.push(GruCell::new(&(p / format!("bwd{layer}")), input_dim, hidden_size));
        }
        Self { embedding, fwd, bwd, n_layers, hidden_size, dropout }
    }

    pub fn n_layers(&self) -> i64 {
        self.n_layers
    }

    /// input_seq: `[T, B]` token indices, lengths sorted descending.
    /// Returns (outputs `[T, B, H]`, hidden `[2 * n_layers, B, H]`); the hidden
    /// stack is layer-major with the two directions interleaved per layer.
    pub fn forward(&self, input_seq: &Tensor, lengths: &[i64], train: bool) -> (Tensor, Tensor) {
        let size = input_seq.size();
        let (max_len, batch) = (size[0], size[1]);
        let device = input_seq.device();

        let lengths_t = Tensor::from_slice(lengths).to_device(device);
        // valid[t][i] <=> t < lengths[i]
        let valid = Tensor::arange(max_len, (Kind::Int64, device))
            .unsqueeze(1)
            .lt_tensor(&lengths_t.unsqueeze(0));

        let zeros = Tensor::zeros([batch, self.hidden_size], (Kind::Float, device));
        let mut layer_input = self.embedding.forward(input_seq);
        let mut final_hiddens: Vec<Tensor> = Vec::with_capacity(2 * self.n_layers as usize);
        let mut summed_outputs: Option<Tensor> = None;

        for layer in 0..self.n_layers as usize {
            let mut out_f: Vec<Tensor> = Vec::with_capacity(max_len as usize);
            let mut h = zeros.shallow_clone();
            for t in 0..max_len {
                let valid_t = valid.get(t).unsqueeze(1);
                let h_new = self.fwd[layer].step(&layer_input.get(t), &h);
                h = h_new.where_self(&valid_t, &h);
                out_f.push(h.where_self(&valid_t, &zeros));
            }

            let mut out_b: Vec<Tensor> = Vec::with_capacity(max_len as usize);
            let mut h_b = zeros.shallow_clone();
            for t in (0..max_len).rev() {
                let valid_t = valid.get(t).unsqueeze(1);
                let h_new = self.bwd[layer].step(&layer_input.get(t), &h_b);
                h_b = h_new.where_self(&valid_t, &h_b);
                out_b.push(h_b.where_self(&valid_t, &zeros));
            }
            out_b.reverse();

            final_hiddens.push(h);
            final_hiddens.push(h_b);

            if layer + 1 == self.n_layers as usize {
                summed_outputs =
                    Some(Tensor::stack(&out_f, 0) + Tensor::stack(&out_b, 0));
            } else {
                let cat: Vec<Tensor> = out_f
                    .iter()
                    .zip(&out_b)
                    .map(|(f, b)| Tensor::cat(&[f, b], 1))
                    .collect();
                // Inter-layer dropout; unreachable for a single layer.
                layer_input = Tensor::stack(&cat, 0).dropout(self.dropout, train);
            }
        }

        let outputs = summed_outputs.expect("encoder has at least one layer");
        let hidden = Tensor::stack(&final_hiddens, 0);
        (outputs, hidden)
    }
}

/// Luong attention decoder. Processes exactly one target time-step per call so
/// the search strategies can stop (or keep sampling) dynamically.
pub struct AttnDecoderRnn {
    embedding: SharedEmbedding,
    layers: Vec<GruCell>,
    attn: Attn,
    concat: nn::Linear,
    out: nn::Linear,
    n_layers: i64,
    dropout: f64,
}

impl AttnDecoderRnn {
    pub fn new(
        p: &nn::Path,
        attn_method: AttnMethod,
        embedding: SharedEmbedding,
        hidden_size: i64,
        output_size: i64,
        n_layers: i64,
        dropout: f64,
    ) -> Self {
        assert!(n_layers >= 1, "decoder needs at least one layer");
        let layers = (0..n_layers)
            .map(|layer| GruCell::new(&(p / format!("gru{layer}")), hidden_size, hidden_size))
            .collect();
        Self {
            embedding,
            layers,
            attn: Attn::new(&(p / "attn"), attn_method, hidden_size),
            concat: nn::linear(p / "concat", hidden_size * 2, hidden_size, Default::default()),
            out: nn::linear(p / "out", hidden_size, output_size, Default::default()),
            n_layers,
            dropout,
        }
    }

    pub fn n_layers(&self) -> i64 {
        self.n_layers
    }

    /// input_step: `[1, B]`, last_hidden: `[n_layers, B, H]`,
    /// encoder_outputs: `[T, B, H]`.
    /// Returns (vocab distribution `[B, V]` post-softmax, new hidden).
    pub fn forward(
        &self,
        input_step: &Tensor,
        last_hidden: &Tensor,
        encoder_outputs: &Tensor,
        train: bool,
    ) -> (Tensor, Tensor) {
        let embedded = self
            .embedding
            .forward(input_step)
            .dropout(self.dropout, train)
            .squeeze_dim(0);

        // One step of the unidirectional stacked GRU.
        let mut new_hiddens: Vec<Tensor> = Vec::with_capacity(self.n_layers as usize);
        let mut x = embedded;
        for (layer, cell) in self.layers.iter().enumerate() {
            let h = cell.step(&x, &last_hidden.get(layer as i64));
            x = if layer + 1 < self.n_layers as usize {
                h.dropout(self.dropout, train)
            } else {
                h.shallow_clone()
            };
            new_hiddens.push(h);
        }
        let rnn_output = new_hiddens
            .last()
            .expect("decoder has at least one layer")
            .shallow_clone();
        let hidden = Tensor::stack(&new_hiddens, 0);

        let attn_weights = self.attn.forward(&rnn_output.unsqueeze(0), encoder_outputs);
        // Weighted sum of encoder outputs: [B, 1, T] x [B, T, H] -> [B, H]
        let context = attn_weights
            .bmm(&encoder_outputs.transpose(0, 1))
            .squeeze_dim(1);

        let concat_input = Tensor::cat(&[rnn_output, context], 1);
        let concat_output = self.concat.forward(&concat_input).tanh();
        let output = self.out.forward(&concat_output).softmax(1, Kind::Float);
        (output, hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::SOS_IDX;
    use tch::Device;

    fn encoder(vs: &nn::VarStore, n_layers: i64, dropout: f64) -> EncoderRnn {
        let root = vs.root();
        let embedding = SharedEmbedding::new(&(&root / "embedding"), 12, 16);
        EncoderRnn::new(&(&root / "encoder"), embedding, 16, n_layers, dropout)
    }

    #[test]
    fn encoder_shapes() {
        tch::manual_seed(5);
        let vs = nn::VarStore::new(Device::Cpu);
        let enc = encoder(&vs, 2, 0.0);
        let input = Tensor::from_slice(&[4i64, 5, 6, 7, 8, 0, 9, 0])
            .view([4, 2]);
        let (outputs, hidden) = enc.forward(&input, &[4, 2], false);
        assert_eq!(outputs.size(), [4, 2, 16]);
        assert_eq!(hidden.size(), [4, 2, 16]);
    }

    #[test]
    fn encoder_ignores_padded_tail() {
        // Batched encoding of a short sequence next to a long one must match
        // encoding the short sequence on its own, both in per-step outputs and
        // in the final hidden state.
        tch::manual_seed(5);
        let vs = nn::VarStore::new(Device::Cpu);
        let enc = encoder(&vs, 2, 0.0);

        let batched = Tensor::from_slice(&[4i64, 5, 6, 7, 8, 0, 9, 0]).view([4, 2]);
        let single = Tensor::from_slice(&[5i64, 7]).view([2, 1]);

        let (out_b, hid_b) = enc.forward(&batched, &[4, 2], false);
        let (out_s, hid_s) = enc.forward(&single, &[2], false);

        let out_diff = (out_b.narrow(0, 0, 2).narrow(1, 1, 1) - &out_s)
            .abs()
            .max()
            .double_value(&[]);
        assert!(out_diff < 1e-5, "outputs diverge by {out_diff}");

        let hid_diff = (hid_b.narrow(1, 1, 1) - &hid_s).abs().max().double_value(&[]);
        assert!(hid_diff < 1e-5, "hidden diverges by {hid_diff}");

        // Padded positions of the short sequence contribute nothing.
        let tail = out_b.narrow(0, 2, 2).narrow(1, 1, 1).abs().max().double_value(&[]);
        assert!(tail < 1e-7, "padded outputs are {tail}, expected zero");
    }

    #[test]
    fn batch_order_does_not_leak_between_elements() {
        // Swapping two equal-length batch elements (the sort precondition still
        // holds) must swap the outputs and nothing else.
        tch::manual_seed(5);
        let vs = nn::VarStore::new(Device::Cpu);
        let enc = encoder(&vs, 2, 0.0);

        let ab = Tensor::from_slice(&[4i64, 7, 5, 8, 6, 9]).view([3, 2]);
        let ba = Tensor::from_slice(&[7i64, 4, 8, 5, 9, 6]).view([3, 2]);

        let (out_ab, hid_ab) = enc.forward(&ab, &[3, 3], false);
        let (out_ba, hid_ba) = enc.forward(&ba, &[3, 3], false);

        let out_diff = (out_ab - out_ba.flip([1])).abs().max().double_value(&[]);
        assert!(out_diff < 1e-6, "outputs diverge by {out_diff}");
        let hid_diff = (hid_ab - hid_ba.flip([1])).abs().max().double_value(&[]);
        assert!(hid_diff < 1e-6, "hidden diverges by {hid_diff}");
    }

    #[test]
    fn single_layer_dropout_is_a_no_op() {
        tch::manual_seed(5);
        let vs = nn::VarStore::new(Device::Cpu);
        let enc = encoder(&vs, 1, 0.7);
        let input = Tensor::from_slice(&[4i64, 5, 6, 7]).view([2, 2]);
        let (a, _) = enc.forward(&input, &[2, 2], true);
        let (b, _) = enc.forward(&input, &[2, 2], true);
        let diff = (a - b).abs().max().double_value(&[]);
        assert!(diff < 1e-7);
    }

    #[test]
    fn decoder_emits_a_distribution_and_next_hidden() {
        tch::manual_seed(5);
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let embedding = SharedEmbedding::new(&(&root / "embedding"), 12, 16);
        let enc = EncoderRnn::new(&(&root / "encoder"), embedding.share(), 16, 2, 0.0);
        let dec = AttnDecoderRnn::new(
            &(&root / "decoder"),
            AttnMethod::Dot,
            embedding,
            16,
            12,
            2,
            0.0,
        );

        let input = Tensor::from_slice(&[4i64, 5, 6, 7, 8, 0]).view([3, 2]);
        let (enc_out, enc_hidden) = enc.forward(&input, &[3, 2], false);
        let dec_hidden = enc_hidden.narrow(0, 0, dec.n_layers());
        let sos = Tensor::full([1, 2], SOS_IDX, (Kind::Int64, Device::Cpu));

        let (probs, hidden) = dec.forward(&sos, &dec_hidden, &enc_out, false);
        assert_eq!(probs.size(), [2, 12]);
        assert_eq!(hidden.size(), [2, 2, 16]);
        for b in 0..2 {
            let s = probs.get(b).sum(Kind::Float).double_value(&[]);
            assert!((s - 1.0).abs() < 1e-5, "row {b} sums to {s}");
        }
    }
}
