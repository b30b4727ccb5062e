// src/data.rs
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use rayon::prelude::*;
use tch::{Device, Tensor};

use crate::vocab::{UnknownWord, Voc, PAD_IDX};

/// One pre-built training batch. Sequences are time-major `[time, batch]` and
/// right-padded; `lengths` is sorted descending and `mask[t][i]` is true iff
/// position `t` of target sequence `i` is not padding.
pub struct Batch {
    pub input: Tensor,
    pub lengths: Vec<i64>,
    pub target: Tensor,
    pub mask: Tensor,
    pub max_target_len: i64,
}

/// Lowercase, detach basic punctuation as its own token, drop everything else.
pub fn normalize_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for ch in s.to_lowercase().chars() {
        match ch {
            'a'..='z' => out.push(ch),
            '.' | '!' | '?' => {
                out.push(' ');
                out.push(ch);
            }
            _ => out.push(' '),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Load (query, response) pairs from a two-column CSV, normalized and filtered
/// to at most `max_length` words per side.
pub fn load_pairs(csv_path: &str, max_length: usize) -> Result<Vec<(String, String)>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(csv_path)
        .context("Failed to open CSV file")?;

    let mut pairs = Vec::new();
    for result in reader.records() {
        let record = result.context("Failed to read CSV record")?;
        if record.len() < 2 {
            continue; // Skip malformed rows
        }

        let query = normalize_string(record[0].trim());
        let response = normalize_string(record[1].trim());

        if query.is_empty()
            || response.is_empty()
            || query.split_whitespace().count() > max_length
            || response.split_whitespace().count() > max_length
        {
            continue;
        }

        pairs.push((query, response));
    }

    Ok(pairs)
}

/// Keep only pairs whose every word survives in the (possibly trimmed) vocabulary.
pub fn filter_pairs_by_voc(voc: &Voc, pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    pairs
        .into_iter()
        .filter(|(q, r)| {
            q.split_whitespace().all(|w| voc.contains(w))
                && r.split_whitespace().all(|w| voc.contains(w))
        })
        .collect()
}

/// Build a padded, length-sorted batch from raw sentence pairs.
pub fn batch_to_train_data(
    voc: &Voc,
    pairs: &[(String, String)],
    device: Device,
) -> Result<Batch> {
    let mut encoded: Vec<(Vec<i64>, Vec<i64>)> = pairs
        .par_iter()
        .map(|(query, response)| {
            let input = voc.indexes_from_sentence(query)?;
            let target = voc.indexes_from_sentence(response)?;
            Ok((input, target))
        })
        .collect::<Result<Vec<_>, UnknownWord>>()?;

    // Descending source lengths; packing-sensitive ops in the encoder rely on it.
    encoded.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let b = encoded.len() as i64;
    let max_input_len = encoded.iter().map(|(i, _)| i.len()).max().unwrap_or(0) as i64;
    let max_target_len = encoded.iter().map(|(_, t)| t.len()).max().unwrap_or(0) as i64;
    let lengths: Vec<i64> = encoded.iter().map(|(i, _)| i.len() as i64).collect();

    // Time-major flat layout: row t holds token t of every sequence.
    let mut input_data = Vec::with_capacity((max_input_len * b) as usize);
    for t in 0..max_input_len as usize {
        for (input, _) in &encoded {
            input_data.push(*input.get(t).unwrap_or(&PAD_IDX));
        }
    }
    let mut target_data = Vec::with_capacity((max_target_len * b) as usize);
    for t in 0..max_target_len as usize {
        for (_, target) in &encoded {
            target_data.push(*target.get(t).unwrap_or(&PAD_IDX));
        }
    }

    let input = Tensor::from_slice(&input_data)
        .view([max_input_len, b])
        .to_device(device);
    let target = Tensor::from_slice(&target_data)
        .view([max_target_len, b])
        .to_device(device);
    let mask = target.ne(PAD_IDX);

    Ok(Batch {
        input,
        lengths,
        target,
        mask,
        max_target_len,
    })
}
