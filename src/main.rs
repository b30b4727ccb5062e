// src/main.rs
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tch::{nn, Device};

use chatrnn::attention::AttnMethod;
use chatrnn::chat;
use chatrnn::checkpoint::{self, CheckpointPaths};
use chatrnn::data::{filter_pairs_by_voc, load_pairs};
use chatrnn::decoding::{evaluate, GreedySearchDecoder, NucleusSampling};
use chatrnn::metrics::bleu_score;
use chatrnn::model::{AttnDecoderRnn, EncoderRnn, SharedEmbedding};
use chatrnn::optim::{named_parameters, Adam};
use chatrnn::training::{train_iters, TrainConfig};
use chatrnn::vocab::{Voc, EOS_TOKEN, PAD_TOKEN};

// Hyperparameters
const MODEL_NAME: &str = "cb_model";
const CORPUS_NAME: &str = "movie-corpus";
const ATTN_METHOD: &str = "dot";
const HIDDEN_SIZE: i64 = 500;
const ENCODER_N_LAYERS: i64 = 2;
const DECODER_N_LAYERS: i64 = 2;
const DROPOUT: f64 = 0.1;
const BATCH_SIZE: usize = 64;
const MAX_LENGTH: i64 = 10;
const MIN_COUNT: i64 = 3;

const N_ITERATION: i64 = 4000;
const LEARNING_RATE: f64 = 0.0001;
const DECODER_LEARNING_RATIO: f64 = 5.0;
const CLIP: f64 = 50.0;
const TEACHER_FORCING_RATIO: f64 = 1.0;
const PRINT_EVERY: i64 = 100;
const SAVE_EVERY: i64 = 500;
const TOP_P: f64 = 0.9;

fn main() -> Result<()> {
    println!("========================================");
    println!("  Conversational RNN with Luong Attention");
    println!("========================================\n");

    let device = if tch::Cuda::is_available() {
        println!("✓ CUDA device detected");
        Device::Cuda(0)
    } else {
        println!("✓ Using CPU");
        Device::Cpu
    };
    println!("✓ CPU cores: {}\n", num_cpus::get());

    // Optional checkpoint to resume from.
    let resume: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);

    println!("Loading conversation pairs...");
    let pairs = load_corpus()?;
    println!("✓ Loaded {} sentence pairs", pairs.len());

    let checkpoint = match &resume {
        Some(path) => {
            println!("Loading checkpoint {}...", path.display());
            Some(checkpoint::load(path)?)
        }
        None => None,
    };

    // The vocabulary fixes the embedding width, so a resumed run must adopt
    // the checkpoint's vocabulary before the model is built.
    let voc = match &checkpoint {
        Some(ckpt) => Voc::from_state(&ckpt.voc)?,
        None => {
            let mut voc = Voc::new(CORPUS_NAME);
            for (query, response) in &pairs {
                voc.add_sentence(query);
                voc.add_sentence(response);
            }
            voc.trim(MIN_COUNT);
            voc
        }
    };
    let pairs = filter_pairs_by_voc(&voc, pairs);
    println!("✓ Vocabulary size: {}", voc.num_words());
    println!("✓ Trainable pairs after trimming: {}\n", pairs.len());

    println!("Initializing encoder and decoder...");
    let vs = nn::VarStore::new(device);
    let root = vs.root();
    let embedding = SharedEmbedding::new(&(&root / "embedding"), voc.num_words(), HIDDEN_SIZE);
    let encoder = EncoderRnn::new(
        &(&root / "encoder"),
        embedding.share(),
        HIDDEN_SIZE,
        ENCODER_N_LAYERS,
        DROPOUT,
    );
    let decoder = AttnDecoderRnn::new(
        &(&root / "decoder"),
        AttnMethod::parse(ATTN_METHOD)?,
        embedding,
        HIDDEN_SIZE,
        voc.num_words(),
        DECODER_N_LAYERS,
        DROPOUT,
    );

    let total_params: i64 = vs
        .trainable_variables()
        .iter()
        .map(|t| t.size().iter().product::<i64>())
        .sum();
    println!("✓ Model initialized with {} trainable parameters\n", total_params);

    let mut encoder_opt = Adam::new(
        named_parameters(&vs, &["embedding", "encoder"]),
        LEARNING_RATE,
    );
    let mut decoder_opt = Adam::new(
        named_parameters(&vs, &["decoder"]),
        LEARNING_RATE * DECODER_LEARNING_RATIO,
    );

    let start_iteration = match &checkpoint {
        Some(ckpt) => {
            let iteration = checkpoint::restore(ckpt, &vs, &mut encoder_opt, &mut decoder_opt)?;
            println!("✓ Resuming from iteration {}\n", iteration);
            iteration
        }
        None => 0,
    };

    let paths = CheckpointPaths {
        save_dir: PathBuf::from("save"),
        model_name: MODEL_NAME.to_string(),
        corpus_name: CORPUS_NAME.to_string(),
        encoder_n_layers: ENCODER_N_LAYERS,
        decoder_n_layers: DECODER_N_LAYERS,
        hidden_size: HIDDEN_SIZE,
    };
    let cfg = TrainConfig {
        n_iteration: N_ITERATION,
        batch_size: BATCH_SIZE,
        clip: CLIP,
        teacher_forcing_ratio: TEACHER_FORCING_RATIO,
        print_every: PRINT_EVERY,
        save_every: SAVE_EVERY,
    };

    println!("Starting training...");
    println!("{}\n", "=".repeat(50));
    train_iters(
        &encoder,
        &decoder,
        &vs,
        &voc,
        &pairs,
        &mut encoder_opt,
        &mut decoder_opt,
        &cfg,
        &paths,
        start_iteration,
    )?;

    println!("\n{}", "=".repeat(50));
    println!("Scoring greedy replies on corpus samples...");
    println!("{}\n", "=".repeat(50));
    sample_replies(&encoder, &decoder, &voc, &pairs, device)?;

    println!("\n{}", "=".repeat(50));
    chat::run_stdio(
        &encoder,
        &decoder,
        &NucleusSampling { top_p: TOP_P },
        &voc,
        MAX_LENGTH,
        device,
    )
}

fn load_corpus() -> Result<Vec<(String, String)>> {
    let csv_paths = ["conversation_pairs.csv", "../conversation_pairs.csv"];
    for path in &csv_paths {
        println!("  Trying: {}", path);
        if Path::new(path).exists() {
            let pairs = load_pairs(path, MAX_LENGTH as usize)?;
            println!("  ✓ Successfully loaded from {}", path);
            return Ok(pairs);
        }
    }
    bail!(
        "Could not find any corpus file!\n\
         Please create conversation_pairs.csv (here or one level up):\n\
         a CSV with 2 columns (query, response)"
    )
}

fn sample_replies(
    encoder: &EncoderRnn,
    decoder: &AttnDecoderRnn,
    voc: &Voc,
    pairs: &[(String, String)],
    device: Device,
) -> Result<()> {
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    let samples: Vec<_> = pairs.choose_multiple(&mut rng, 5).collect();

    let mut total_bleu = 0.0;
    for (i, (query, reference)) in samples.iter().enumerate() {
        println!("\n--- Sample {} ---", i + 1);
        println!("Query:     {}", query);
        println!("Reference: {}", reference);

        let words = match evaluate(
            encoder,
            decoder,
            &GreedySearchDecoder,
            voc,
            query,
            MAX_LENGTH,
            device,
        ) {
            Ok(words) => words,
            Err(err) => {
                println!("Error: {err}");
                continue;
            }
        };
        let reply = words
            .iter()
            .map(String::as_str)
            .filter(|w| *w != EOS_TOKEN && *w != PAD_TOKEN)
            .collect::<Vec<_>>()
            .join(" ");
        println!("Generated: {}", reply);

        let bleu = bleu_score(reference, &reply);
        println!(
            "BLEU-1: {:.4}  BLEU-2: {:.4}  BLEU-3: {:.4}  BLEU-4: {:.4}  Overall: {:.4}",
            bleu.precisions[0], bleu.precisions[1], bleu.precisions[2], bleu.precisions[3],
            bleu.bleu
        );
        total_bleu += bleu.bleu;
    }

    if !samples.is_empty() {
        println!("\nAverage BLEU: {:.4}", total_bleu / samples.len() as f64);
    }
    Ok(())
}
