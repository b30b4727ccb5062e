// src/checkpoint.rs
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tch::nn;

use crate::optim::{self, Adam, AdamState};
use crate::vocab::{Voc, VocState};

pub const CHECKPOINT_VERSION: u32 = 1;

/// One named parameter, flattened to f32 for JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

/// Everything needed to resume training exactly where it stopped: model
/// parameters grouped by component, both optimizer states, the vocabulary,
/// and the iteration counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub iteration: i64,
    pub loss: f64,
    pub embedding: Vec<TensorEntry>,
    pub encoder: Vec<TensorEntry>,
    pub decoder: Vec<TensorEntry>,
    pub encoder_opt: AdamState,
    pub decoder_opt: AdamState,
    pub voc: VocState,
}

/// Where checkpoints live:
/// `<save_dir>/<model_name>/<corpus_name>/<enc>-<dec>_<hidden>/<iteration>_checkpoint.json`.
pub struct CheckpointPaths {
    pub save_dir: PathBuf,
    pub model_name: String,
    pub corpus_name: String,
    pub encoder_n_layers: i64,
    pub decoder_n_layers: i64,
    pub hidden_size: i64,
}

impl CheckpointPaths {
    pub fn dir(&self) -> PathBuf {
        self.save_dir
            .join(&self.model_name)
            .join(&self.corpus_name)
            .join(format!(
                "{}-{}_{}",
                self.encoder_n_layers, self.decoder_n_layers, self.hidden_size
            ))
    }

    pub fn file(&self, iteration: i64) -> PathBuf {
        self.dir().join(format!("{iteration}_checkpoint.json"))
    }
}

fn snapshot_group(vs: &nn::VarStore, prefix: &str) -> Result<Vec<TensorEntry>> {
    let mut entries = Vec::new();
    for (name, tensor) in optim::named_parameters(vs, &[prefix]) {
        entries.push(TensorEntry {
            shape: tensor.size(),
            data: optim::tensor_to_vec(&tensor)?,
            name,
        });
    }
    Ok(entries)
}

/// Snapshot the full training state.
pub fn build(
    vs: &nn::VarStore,
    voc: &Voc,
    encoder_opt: &Adam,
    decoder_opt: &Adam,
    iteration: i64,
    loss: f64,
) -> Result<Checkpoint> {
    Ok(Checkpoint {
        version: CHECKPOINT_VERSION,
        iteration,
        loss,
        embedding: snapshot_group(vs, "embedding")?,
        encoder: snapshot_group(vs, "encoder")?,
        decoder: snapshot_group(vs, "decoder")?,
        encoder_opt: encoder_opt.state()?,
        decoder_opt: decoder_opt.state()?,
        voc: voc.to_state(),
    })
}

pub fn save(paths: &CheckpointPaths, checkpoint: &Checkpoint) -> Result<PathBuf> {
    let dir = paths.dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;
    let path = paths.file(checkpoint.iteration);
    let file = File::create(&path)
        .with_context(|| format!("Failed to create checkpoint file {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), checkpoint)
        .context("Failed to serialize checkpoint")?;
    Ok(path)
}

pub fn load(path: &Path) -> Result<Checkpoint> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open checkpoint file {}", path.display()))?;
    let checkpoint: Checkpoint =
        serde_json::from_reader(BufReader::new(file)).context("Failed to parse checkpoint")?;
    if checkpoint.version != CHECKPOINT_VERSION {
        bail!(
            "unsupported checkpoint version {} (expected {})",
            checkpoint.version,
            CHECKPOINT_VERSION
        );
    }
    Ok(checkpoint)
}

fn restore_group(vs: &nn::VarStore, entries: &[TensorEntry]) -> Result<()> {
    let vars = vs.variables();
    for entry in entries {
        let Some(param) = vars.get(&entry.name) else {
            bail!("checkpoint names parameter {} which the model does not have", entry.name);
        };
        if param.size() != entry.shape {
            bail!(
                "checkpoint parameter {} has shape {:?}, model expects {:?}",
                entry.name,
                entry.shape,
                param.size()
            );
        }
        tch::no_grad(|| {
            let mut dst = param.shallow_clone();
            dst.copy_(&optim::vec_to_tensor(&entry.data, &entry.shape, param.device()));
        });
    }
    Ok(())
}

/// Copy a loaded checkpoint into a freshly built model and its optimizers.
/// Returns the iteration to resume from.
pub fn restore(
    checkpoint: &Checkpoint,
    vs: &nn::VarStore,
    encoder_opt: &mut Adam,
    decoder_opt: &mut Adam,
) -> Result<i64> {
    restore_group(vs, &checkpoint.embedding)?;
    restore_group(vs, &checkpoint.encoder)?;
    restore_group(vs, &checkpoint.decoder)?;
    encoder_opt.load_state(&checkpoint.encoder_opt)?;
    decoder_opt.load_state(&checkpoint.decoder_opt)?;
    Ok(checkpoint.iteration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::AttnMethod;
    use crate::model::{AttnDecoderRnn, EncoderRnn, SharedEmbedding};
    use crate::optim::named_parameters;
    use tch::Device;

    fn build_model(vs: &nn::VarStore) -> (EncoderRnn, AttnDecoderRnn) {
        let root = vs.root();
        let embedding = SharedEmbedding::new(&(&root / "embedding"), 10, 8);
        let encoder = EncoderRnn::new(&(&root / "encoder"), embedding.share(), 8, 2, 0.0);
        let decoder = AttnDecoderRnn::new(
            &(&root / "decoder"),
            AttnMethod::General,
            embedding,
            8,
            10,
            2,
            0.0,
        );
        (encoder, decoder)
    }

    fn paths_in(dir: &Path) -> CheckpointPaths {
        CheckpointPaths {
            save_dir: dir.to_path_buf(),
            model_name: "cb_model".to_string(),
            corpus_name: "corpus".to_string(),
            encoder_n_layers: 2,
            decoder_n_layers: 2,
            hidden_size: 8,
        }
    }

    #[test]
    fn path_convention() {
        let paths = paths_in(Path::new("save"));
        assert_eq!(
            paths.file(4000),
            Path::new("save/cb_model/corpus/2-2_8/4000_checkpoint.json")
        );
    }

    #[test]
    fn round_trip_restores_every_parameter() {
        tch::manual_seed(23);
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_in(tmp.path());

        let vs_a = nn::VarStore::new(Device::Cpu);
        let _model_a = build_model(&vs_a);
        let enc_opt_a = Adam::new(named_parameters(&vs_a, &["embedding", "encoder"]), 1e-3);
        let dec_opt_a = Adam::new(named_parameters(&vs_a, &["decoder"]), 5e-3);

        let mut voc = Voc::new("corpus");
        voc.add_sentence("hello there friend");

        let ckpt = build(&vs_a, &voc, &enc_opt_a, &dec_opt_a, 500, 1.25).unwrap();
        let saved = save(&paths, &ckpt).unwrap();
        assert!(saved.ends_with("500_checkpoint.json"));

        let loaded = load(&saved).unwrap();
        assert_eq!(loaded.iteration, 500);

        // A differently seeded model converges to the saved weights exactly.
        tch::manual_seed(99);
        let vs_b = nn::VarStore::new(Device::Cpu);
        let _model_b = build_model(&vs_b);
        let mut enc_opt_b = Adam::new(named_parameters(&vs_b, &["embedding", "encoder"]), 1e-3);
        let mut dec_opt_b = Adam::new(named_parameters(&vs_b, &["decoder"]), 5e-3);
        let iteration = restore(&loaded, &vs_b, &mut enc_opt_b, &mut dec_opt_b).unwrap();
        assert_eq!(iteration, 500);

        let vars_a = vs_a.variables();
        for (name, b) in vs_b.variables() {
            let a = &vars_a[&name];
            let diff = (a - &b).abs().max().double_value(&[]);
            assert!(diff == 0.0, "{name} differs by {diff}");
        }

        let restored_voc = Voc::from_state(&loaded.voc).unwrap();
        assert!(restored_voc.contains("friend"));
    }

    #[test]
    fn missing_parameter_is_a_hard_error() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _model = build_model(&vs);
        let mut enc_opt = Adam::new(named_parameters(&vs, &["embedding", "encoder"]), 1e-3);
        let mut dec_opt = Adam::new(named_parameters(&vs, &["decoder"]), 5e-3);
        let voc = Voc::new("corpus");

        let mut ckpt = build(&vs, &voc, &enc_opt, &dec_opt, 1, 0.0).unwrap();
        ckpt.encoder[0].name = "encoder.nonexistent".to_string();
        assert!(restore(&ckpt, &vs, &mut enc_opt, &mut dec_opt).is_err());
    }
}
