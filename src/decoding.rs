// src/decoding.rs
use tch::{Device, Kind, Tensor};

use crate::model::{AttnDecoderRnn, EncoderRnn};
use crate::vocab::{UnknownWord, Voc, SOS_IDX};

/// A decoding strategy over a trained encoder/decoder pair. `input_seq` is a
/// single time-major sequence `[T, 1]`; the result is exactly `max_length`
/// tokens with their scores. There is no early exit on end-of-sentence, the
/// caller trims the tail.
pub trait Searcher {
    fn search(
        &self,
        encoder: &EncoderRnn,
        decoder: &AttnDecoderRnn,
        input_seq: &Tensor,
        lengths: &[i64],
        max_length: i64,
    ) -> (Vec<i64>, Vec<f64>);
}

fn run_search(
    encoder: &EncoderRnn,
    decoder: &AttnDecoderRnn,
    input_seq: &Tensor,
    lengths: &[i64],
    max_length: i64,
    pick: impl Fn(&Tensor) -> (f64, i64),
) -> (Vec<i64>, Vec<f64>) {
    tch::no_grad(|| {
        let device = input_seq.device();
        let (encoder_outputs, encoder_hidden) = encoder.forward(input_seq, lengths, false);
        let mut decoder_hidden = encoder_hidden.narrow(0, 0, decoder.n_layers());
        let mut decoder_input = Tensor::full([1, 1], SOS_IDX, (Kind::Int64, device));

        let mut tokens = Vec::with_capacity(max_length as usize);
        let mut scores = Vec::with_capacity(max_length as usize);
        for _ in 0..max_length {
            let (probs, hidden) =
                decoder.forward(&decoder_input, &decoder_hidden, &encoder_outputs, false);
            decoder_hidden = hidden;

            let (score, token) = pick(&probs);
            tokens.push(token);
            scores.push(score);
            decoder_input = Tensor::from_slice(&[token]).view([1, 1]).to_device(device);
        }
        (tokens, scores)
    })
}

/// Take the most likely token at every step.
pub struct GreedySearchDecoder;

impl Searcher for GreedySearchDecoder {
    fn search(
        &self,
        encoder: &EncoderRnn,
        decoder: &AttnDecoderRnn,
        input_seq: &Tensor,
        lengths: &[i64],
        max_length: i64,
    ) -> (Vec<i64>, Vec<f64>) {
        run_search(encoder, decoder, input_seq, lengths, max_length, |probs| {
            let (values, indices) = probs.max_dim(1, false);
            (values.double_value(&[0]), indices.int64_value(&[0]))
        })
    }
}

/// Drop every token outside the smallest set whose cumulative probability
/// exceeds `top_p`, then take the best survivor.
pub struct NucleusSampling {
    pub top_p: f64,
}

/// Mask the tail of the distribution to -inf. Probabilities are sorted
/// descending and cumulative-summed; the removal mask is shifted right one
/// slot so the first token crossing the threshold always survives (which also
/// guarantees a non-empty result).
pub fn nucleus_filter(probs: &Tensor, top_p: f64) -> Tensor {
    let device = probs.device();
    let v = probs.size()[1];
    let (sorted, indices) = probs.sort(-1, true);
    let cumulative = sorted.cumsum(-1, Kind::Float);

    let remove = cumulative.gt(top_p);
    let keep_first = Tensor::zeros([1, 1], (Kind::Bool, device));
    let shifted = Tensor::cat(&[keep_first, remove.narrow(1, 0, v - 1)], 1);

    let filtered_sorted = sorted.masked_fill(&shifted, f64::NEG_INFINITY);
    Tensor::full([1, v], f64::NEG_INFINITY, (Kind::Float, device))
        .scatter(-1, &indices, &filtered_sorted)
}

impl Searcher for NucleusSampling {
    fn search(
        &self,
        encoder: &EncoderRnn,
        decoder: &AttnDecoderRnn,
        input_seq: &Tensor,
        lengths: &[i64],
        max_length: i64,
    ) -> (Vec<i64>, Vec<f64>) {
        run_search(encoder, decoder, input_seq, lengths, max_length, |probs| {
            let filtered = nucleus_filter(probs, self.top_p);
            let (values, indices) = filtered.max_dim(1, false);
            (values.double_value(&[0]), indices.int64_value(&[0]))
        })
    }
}

/// Decode a reply to one normalized sentence. The result still carries any
/// trailing end/pad markers; the interactive loop strips them.
pub fn evaluate(
    encoder: &EncoderRnn,
    decoder: &AttnDecoderRnn,
    searcher: &dyn Searcher,
    voc: &Voc,
    sentence: &str,
    max_length: i64,
    device: Device,
) -> Result<Vec<String>, UnknownWord> {
    let indexes = voc.indexes_from_sentence(sentence)?;
    let lengths = vec![indexes.len() as i64];
    let input_seq = Tensor::from_slice(&indexes)
        .view([indexes.len() as i64, 1])
        .to_device(device);

    let (tokens, _scores) = searcher.search(encoder, decoder, &input_seq, &lengths, max_length);
    Ok(tokens
        .into_iter()
        .map(|idx| voc.index_to_word(idx).to_string())
        .collect())
}
