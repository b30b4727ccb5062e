// src/vocab.rs
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PAD_TOKEN: &str = "<PAD>";
pub const UNK_TOKEN: &str = "<UNK>";
pub const SOS_TOKEN: &str = "<SOS>";
pub const EOS_TOKEN: &str = "<EOS>";

pub const PAD_IDX: i64 = 0;
pub const UNK_IDX: i64 = 1;
pub const SOS_IDX: i64 = 2;
pub const EOS_IDX: i64 = 3;

const NUM_RESERVED: usize = 4;

pub const VOC_STATE_VERSION: u32 = 1;

/// Inference-time lookup failure. The chat loop catches this and keeps going.
#[derive(Debug, Error)]
#[error("Encountered unknown word: {0}")]
pub struct UnknownWord(pub String);

/// Word-level vocabulary shared by both sides of a conversation pair.
/// Built once from the corpus, immutable during training and inference.
pub struct Voc {
    pub name: String,
    word2index: HashMap<String, i64>,
    word2count: HashMap<String, i64>,
    index2word: Vec<String>,
}

impl Voc {
    pub fn new(name: &str) -> Self {
        let reserved = [PAD_TOKEN, UNK_TOKEN, SOS_TOKEN, EOS_TOKEN];
        let mut word2index = HashMap::new();
        let mut index2word = Vec::with_capacity(NUM_RESERVED);
        for (idx, token) in reserved.iter().enumerate() {
            word2index.insert(token.to_string(), idx as i64);
            index2word.push(token.to_string());
        }
        Self {
            name: name.to_string(),
            word2index,
            word2count: HashMap::new(),
            index2word,
        }
    }

    pub fn add_sentence(&mut self, sentence: &str) {
        for word in sentence.split_whitespace() {
            self.add_word(word);
        }
    }

    pub fn add_word(&mut self, word: &str) {
        if let Some(count) = self.word2count.get_mut(word) {
            *count += 1;
        } else {
            let idx = self.index2word.len() as i64;
            self.word2index.insert(word.to_string(), idx);
            self.word2count.insert(word.to_string(), 1);
            self.index2word.push(word.to_string());
        }
    }

    /// Drop words seen fewer than `min_count` times and reindex the rest.
    pub fn trim(&mut self, min_count: i64) {
        let keep: Vec<(String, i64)> = self
            .index2word
            .iter()
            .skip(NUM_RESERVED)
            .filter_map(|w| {
                let count = *self.word2count.get(w).unwrap_or(&0);
                (count >= min_count).then(|| (w.clone(), count))
            })
            .collect();

        let name = self.name.clone();
        *self = Voc::new(&name);
        for (word, count) in keep {
            let idx = self.index2word.len() as i64;
            self.word2index.insert(word.clone(), idx);
            self.word2count.insert(word.clone(), count);
            self.index2word.push(word);
        }
    }

    pub fn num_words(&self) -> i64 {
        self.index2word.len() as i64
    }

    pub fn contains(&self, word: &str) -> bool {
        self.word2index.contains_key(word)
    }

    pub fn word_to_index(&self, word: &str) -> Result<i64, UnknownWord> {
        self.word2index
            .get(word)
            .copied()
            .ok_or_else(|| UnknownWord(word.to_string()))
    }

    /// Stray indices (outside the table) map to the unknown marker rather than panicking.
    pub fn index_to_word(&self, index: i64) -> &str {
        self.index2word
            .get(index as usize)
            .map(String::as_str)
            .unwrap_or(UNK_TOKEN)
    }

    /// Token indices for a sentence, terminated with EOS.
    pub fn indexes_from_sentence(&self, sentence: &str) -> Result<Vec<i64>, UnknownWord> {
        let mut indexes = Vec::new();
        for word in sentence.split_whitespace() {
            indexes.push(self.word_to_index(word)?);
        }
        indexes.push(EOS_IDX);
        Ok(indexes)
    }

    pub fn to_state(&self) -> VocState {
        let counts = self
            .index2word
            .iter()
            .map(|w| *self.word2count.get(w).unwrap_or(&0))
            .collect();
        VocState {
            version: VOC_STATE_VERSION,
            name: self.name.clone(),
            words: self.index2word.clone(),
            counts,
        }
    }

    pub fn from_state(state: &VocState) -> anyhow::Result<Self> {
        if state.version != VOC_STATE_VERSION {
            anyhow::bail!(
                "unsupported vocabulary state version {} (expected {})",
                state.version,
                VOC_STATE_VERSION
            );
        }
        if state.words.len() < NUM_RESERVED || state.words[PAD_IDX as usize] != PAD_TOKEN {
            anyhow::bail!("vocabulary state is missing the reserved tokens");
        }
        if state.counts.len() != state.words.len() {
            anyhow::bail!(
                "vocabulary state has {} counts for {} words",
                state.counts.len(),
                state.words.len()
            );
        }
        let mut word2index = HashMap::new();
        let mut word2count = HashMap::new();
        for (idx, word) in state.words.iter().enumerate() {
            word2index.insert(word.clone(), idx as i64);
            if idx >= NUM_RESERVED {
                word2count.insert(word.clone(), state.counts[idx]);
            }
        }
        Ok(Self {
            name: state.name.clone(),
            word2index,
            word2count,
            index2word: state.words.clone(),
        })
    }
}

/// Serializable vocabulary snapshot stored inside checkpoints.
/// Words are listed in index order; counts are parallel (zero for reserved tokens).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocState {
    pub version: u32,
    pub name: String,
    pub words: Vec<String>,
    pub counts: Vec<i64>,
}
