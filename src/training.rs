// src/training.rs
use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tch::{nn, Kind, Tensor};

use crate::checkpoint::{self, CheckpointPaths};
use crate::data::{batch_to_train_data, Batch};
use crate::model::{AttnDecoderRnn, EncoderRnn};
use crate::optim::Adam;
use crate::vocab::{Voc, SOS_IDX};

pub struct TrainConfig {
    pub n_iteration: i64,
    pub batch_size: usize,
    pub clip: f64,
    pub teacher_forcing_ratio: f64,
    pub print_every: i64,
    pub save_every: i64,
}

/// Negative log likelihood of the reference tokens under the decoder's
/// distribution, averaged over unmasked positions. Returns the scalar loss and
/// the number of positions it covers.
pub fn mask_nll_loss(probs: &Tensor, target: &Tensor, mask: &Tensor) -> (Tensor, i64) {
    let n_total = mask.sum(Kind::Int64).int64_value(&[]);
    if n_total == 0 {
        // Zero that stays attached to the graph; a fully padded step
        // contributes no gradient but keeps backward() well-defined.
        return (probs.sum(Kind::Float) * 0.0, 0);
    }
    let gathered = probs.gather(1, &target.unsqueeze(1), false).squeeze_dim(1);
    let cross_entropy = -gathered.clamp_min(1e-12).log();
    let loss = cross_entropy.masked_select(mask).mean(Kind::Float);
    (loss, n_total)
}

/// One optimization step over a single batch. The teacher-forcing coin is
/// flipped once and governs every target step of this batch. Returns the
/// token-weighted average loss.
pub fn train_step(
    encoder: &EncoderRnn,
    decoder: &AttnDecoderRnn,
    batch: &Batch,
    encoder_opt: &mut Adam,
    decoder_opt: &mut Adam,
    clip: f64,
    teacher_forcing_ratio: f64,
) -> f64 {
    encoder_opt.zero_grad();
    decoder_opt.zero_grad();

    let device = batch.input.device();
    let b = batch.input.size()[1];

    let (encoder_outputs, encoder_hidden) = encoder.forward(&batch.input, &batch.lengths, true);

    let mut decoder_input = Tensor::full([1, b], SOS_IDX, (Kind::Int64, device));
    // Forward-direction states of the encoder's first decoder.n_layers layers.
    let mut decoder_hidden = encoder_hidden.narrow(0, 0, decoder.n_layers());

    let use_teacher_forcing = rand::thread_rng().gen::<f64>() < teacher_forcing_ratio;

    let mut loss = Tensor::from(0f32).to_device(device);
    let mut print_loss = 0.0f64;
    let mut n_totals = 0i64;

    for t in 0..batch.max_target_len {
        let (probs, hidden) =
            decoder.forward(&decoder_input, &decoder_hidden, &encoder_outputs, true);
        decoder_hidden = hidden;

        let target_t = batch.target.get(t);
        let (step_loss, n_total) = mask_nll_loss(&probs, &target_t, &batch.mask.get(t));
        if n_total > 0 {
            print_loss += step_loss.double_value(&[]) * n_total as f64;
            n_totals += n_total;
            loss = loss + step_loss;
        }

        decoder_input = if use_teacher_forcing {
            target_t.unsqueeze(0)
        } else {
            probs.max_dim(1, false).1.unsqueeze(0)
        };
    }

    if n_totals == 0 {
        return 0.0;
    }

    loss.backward();
    encoder_opt.clip_grad_norm(clip);
    decoder_opt.clip_grad_norm(clip);
    encoder_opt.step();
    decoder_opt.step();

    print_loss / n_totals as f64
}

/// Outer training loop: sample every batch up front, then run `train_step`
/// per iteration, logging a running average every `print_every` iterations
/// and writing a checkpoint every `save_every`.
pub fn train_iters(
    encoder: &EncoderRnn,
    decoder: &AttnDecoderRnn,
    vs: &nn::VarStore,
    voc: &Voc,
    pairs: &[(String, String)],
    encoder_opt: &mut Adam,
    decoder_opt: &mut Adam,
    cfg: &TrainConfig,
    paths: &CheckpointPaths,
    start_iteration: i64,
) -> Result<()> {
    if pairs.is_empty() {
        bail!("No training pairs left after filtering");
    }

    println!("Initializing {} training batches...", cfg.n_iteration);
    let mut rng = rand::thread_rng();
    let mut batches = Vec::with_capacity(cfg.n_iteration as usize);
    for _ in 0..cfg.n_iteration {
        let sample: Vec<(String, String)> = (0..cfg.batch_size)
            .map(|_| pairs[rng.gen_range(0..pairs.len())].clone())
            .collect();
        batches.push(batch_to_train_data(voc, &sample, vs.device())?);
    }

    let pb = ProgressBar::new(cfg.n_iteration as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb.set_position(start_iteration as u64);

    let mut print_loss = 0.0f64;
    for iteration in start_iteration + 1..=cfg.n_iteration {
        let batch = &batches[(iteration - 1) as usize];
        let loss = train_step(
            encoder,
            decoder,
            batch,
            encoder_opt,
            decoder_opt,
            cfg.clip,
            cfg.teacher_forcing_ratio,
        );
        print_loss += loss;
        pb.set_message(format!("Loss: {:.4}", loss));
        pb.inc(1);

        if iteration % cfg.print_every == 0 {
            let avg = print_loss / cfg.print_every as f64;
            pb.println(format!(
                "Iteration: {}; Percent complete: {:.1}%; Average loss: {:.4}",
                iteration,
                iteration as f64 / cfg.n_iteration as f64 * 100.0,
                avg
            ));
            print_loss = 0.0;
        }

        if iteration % cfg.save_every == 0 {
            let ckpt =
                checkpoint::build(vs, voc, encoder_opt, decoder_opt, iteration, loss)?;
            let path = checkpoint::save(paths, &ckpt)?;
            pb.println(format!("Saved checkpoint to {}", path.display()));
        }
    }

    pb.finish_with_message("Training complete");
    Ok(())
}
