//! Interfaces of the collaborators the decode loop drives.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    #[default]
    Image,
    Audio,
}

/// Preprocessed multimodal input handed to the forward step during prefill.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: PayloadKind,
    pub bytes: Vec<u8>,
}

/// The execution engine producing one logit vector per input token.
pub trait Forward {
    fn vocab_size(&self) -> usize;
    /// Run the whole prompt and return the logits of its last position.
    fn prefill(&mut self, tokens: &[u32], payload: Option<&Payload>) -> Result<Vec<f32>>;
    /// Run one token and return the logits of the next position.
    fn forward(&mut self, token: u32) -> Result<Vec<f32>>;
    /// Drop all cached context.
    fn clear_context(&mut self);
}

pub trait Tokenizer {
    fn vocab_size(&self) -> usize;
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Decode into raw bytes; a single token may end inside a UTF-8 sequence.
    fn decode(&self, tokens: &[u32]) -> Result<Vec<u8>>;
}

/// Turns per-token byte chunks into text fragments made of complete characters only.
#[derive(Debug, Default, Clone)]
pub struct IncrementalDecoder {
    buffer: Vec<u8>,
}

impl IncrementalDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return the longest complete text available.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.buffer.extend_from_slice(bytes);

        let mut output = String::new();
        loop {
            match std::str::from_utf8(&self.buffer) {
                Ok(text) => {
                    output.push_str(text);
                    self.buffer.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    output.push_str(&String::from_utf8_lossy(&self.buffer[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            output.push(char::REPLACEMENT_CHARACTER);
                            self.buffer.drain(..valid + len);
                        }
                        None => {
                            self.buffer.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        output
    }

    /// Emit whatever is left, replacing an unfinished sequence.
    pub fn flush(&mut self) -> String {
        let output = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        output
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
