// tests/end_to_end.rs
use approx::assert_abs_diff_eq;
use tch::{nn, Device};

use chatrnn::attention::AttnMethod;
use chatrnn::checkpoint::{self, CheckpointPaths};
use chatrnn::data::{batch_to_train_data, Batch};
use chatrnn::decoding::{evaluate, GreedySearchDecoder};
use chatrnn::model::{AttnDecoderRnn, EncoderRnn, SharedEmbedding};
use chatrnn::optim::{named_parameters, Adam};
use chatrnn::training::train_step;
use chatrnn::vocab::Voc;

const HIDDEN: i64 = 16;
const N_LAYERS: i64 = 1;
const CLIP: f64 = 50.0;

fn corpus() -> (Voc, Vec<(String, String)>) {
    let pairs: Vec<(String, String)> = [
        ("hello", "hi there"),
        ("how are you", "fine thanks"),
        ("good morning", "morning friend"),
    ]
    .iter()
    .map(|(q, r)| (q.to_string(), r.to_string()))
    .collect();

    let mut voc = Voc::new("tiny");
    for (q, r) in &pairs {
        voc.add_sentence(q);
        voc.add_sentence(r);
    }
    (voc, pairs)
}

struct Setup {
    vs: nn::VarStore,
    encoder: EncoderRnn,
    decoder: AttnDecoderRnn,
    encoder_opt: Adam,
    decoder_opt: Adam,
}

fn setup(seed: i64, vocab_size: i64) -> Setup {
    tch::manual_seed(seed);
    let vs = nn::VarStore::new(Device::Cpu);
    let root = vs.root();
    // Dropout stays zero so two runs over the same weights are identical.
    let embedding = SharedEmbedding::new(&(&root / "embedding"), vocab_size, HIDDEN);
    let encoder = EncoderRnn::new(&(&root / "encoder"), embedding.share(), HIDDEN, N_LAYERS, 0.0);
    let decoder = AttnDecoderRnn::new(
        &(&root / "decoder"),
        AttnMethod::Dot,
        embedding,
        HIDDEN,
        vocab_size,
        N_LAYERS,
        0.0,
    );
    let encoder_opt = Adam::new(named_parameters(&vs, &["embedding", "encoder"]), 0.005);
    let decoder_opt = Adam::new(named_parameters(&vs, &["decoder"]), 0.025);
    Setup { vs, encoder, decoder, encoder_opt, decoder_opt }
}

fn step(s: &mut Setup, batch: &Batch) -> f64 {
    train_step(
        &s.encoder,
        &s.decoder,
        batch,
        &mut s.encoder_opt,
        &mut s.decoder_opt,
        CLIP,
        1.0,
    )
}

#[test]
fn tiny_corpus_converges_and_replies() {
    let (voc, pairs) = corpus();
    let batch = batch_to_train_data(&voc, &pairs, Device::Cpu).unwrap();
    let mut s = setup(7, voc.num_words());

    let first = step(&mut s, &batch);
    let mut last = first;
    for _ in 0..200 {
        last = step(&mut s, &batch);
    }
    assert!(
        last < 0.5 && last < first,
        "expected near-zero loss, went from {first} to {last}"
    );

    // Decoding always runs the full budget; trimming is the caller's job.
    let words = evaluate(
        &s.encoder,
        &s.decoder,
        &GreedySearchDecoder,
        &voc,
        "hello",
        10,
        Device::Cpu,
    )
    .unwrap();
    assert_eq!(words.len(), 10);
}

#[test]
fn resume_reproduces_the_loss_trajectory() {
    let (voc, pairs) = corpus();
    let batch = batch_to_train_data(&voc, &pairs, Device::Cpu).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = CheckpointPaths {
        save_dir: tmp.path().to_path_buf(),
        model_name: "cb_model".to_string(),
        corpus_name: "tiny".to_string(),
        encoder_n_layers: N_LAYERS,
        decoder_n_layers: N_LAYERS,
        hidden_size: HIDDEN,
    };

    // First run: warm up, snapshot, keep training and record the losses.
    let mut a = setup(7, voc.num_words());
    for _ in 0..5 {
        step(&mut a, &batch);
    }
    let ckpt = checkpoint::build(&a.vs, &voc, &a.encoder_opt, &a.decoder_opt, 5, 0.0).unwrap();
    let saved = checkpoint::save(&paths, &ckpt).unwrap();

    let continued: Vec<f64> = (0..5).map(|_| step(&mut a, &batch)).collect();

    // Second run: different init, restored from disk, same batch sequence.
    let mut b = setup(99, voc.num_words());
    let loaded = checkpoint::load(&saved).unwrap();
    let iteration =
        checkpoint::restore(&loaded, &b.vs, &mut b.encoder_opt, &mut b.decoder_opt).unwrap();
    assert_eq!(iteration, 5);

    let resumed: Vec<f64> = (0..5).map(|_| step(&mut b, &batch)).collect();
    for (c, r) in continued.iter().zip(&resumed) {
        assert_abs_diff_eq!(c, r, epsilon = 1e-4);
    }

    let restored_voc = Voc::from_state(&loaded.voc).unwrap();
    assert_eq!(restored_voc.num_words(), voc.num_words());
}
