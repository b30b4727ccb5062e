// src/chat.rs
use std::io::{self, BufRead, Write};

use anyhow::Result;
use tch::Device;

use crate::data::normalize_string;
use crate::decoding::{evaluate, Searcher};
use crate::model::{AttnDecoderRnn, EncoderRnn};
use crate::vocab::{Voc, EOS_TOKEN, PAD_TOKEN};

/// Interactive evaluation: read a line, decode a reply, print it. Quits on
/// `q`/`quit` or end of input. An out-of-vocabulary word is reported and the
/// session keeps going.
pub fn run(
    encoder: &EncoderRnn,
    decoder: &AttnDecoderRnn,
    searcher: &dyn Searcher,
    voc: &Voc,
    max_length: i64,
    device: Device,
    input: impl BufRead,
    mut output: impl Write,
) -> Result<()> {
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line == "q" || line == "quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        let sentence = normalize_string(line);
        match evaluate(encoder, decoder, searcher, voc, &sentence, max_length, device) {
            Ok(words) => {
                let reply: Vec<&str> = words
                    .iter()
                    .map(String::as_str)
                    .filter(|w| *w != EOS_TOKEN && *w != PAD_TOKEN)
                    .collect();
                writeln!(output, "Bot: {}", reply.join(" "))?;
            }
            Err(err) => writeln!(output, "Error: {err}")?,
        }
        output.flush()?;
    }
    Ok(())
}

/// `run` wired to the process's stdin/stdout.
pub fn run_stdio(
    encoder: &EncoderRnn,
    decoder: &AttnDecoderRnn,
    searcher: &dyn Searcher,
    voc: &Voc,
    max_length: i64,
    device: Device,
) -> Result<()> {
    println!("Type a message to chat; q or quit exits.");
    run(
        encoder,
        decoder,
        searcher,
        voc,
        max_length,
        device,
        io::stdin().lock(),
        io::stdout(),
    )
}
