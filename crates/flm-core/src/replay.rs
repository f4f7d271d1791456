//! Table-driven stand-ins for the tokenizer and the forward step, used to replay a fixed
//! token script through a session without an accelerator.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::engine::{Forward, Payload, Tokenizer};

/// Logit given to the scripted token; every other entry stays at zero.
pub const SCRIPT_PEAK: f32 = 30.0;

/// Tokenizer over an explicit vocabulary, encoding by greedy longest match.
///
/// Entries of the form `<0xHH>` stand for a single raw byte.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    tokens: Vec<Vec<u8>>,
    index: HashMap<Vec<u8>, u32>,
    max_len: usize,
}

impl VocabTokenizer {
    pub fn new(vocab: Vec<String>) -> Self {
        let tokens: Vec<Vec<u8>> = vocab
            .into_iter()
            .map(|token| match parse_byte_token(&token) {
                Some(byte) => vec![byte],
                None => token.into_bytes(),
            })
            .collect();

        let mut index = HashMap::with_capacity(tokens.len());
        for (id, bytes) in tokens.iter().enumerate() {
            // first entry wins on duplicates
            index.entry(bytes.clone()).or_insert(id as u32);
        }
        let max_len = tokens.iter().map(Vec::len).max().unwrap_or_default();

        Self {
            tokens,
            index,
            max_len,
        }
    }

    /// Load from a JSON array of token strings.
    pub fn from_json(contents: &str) -> Result<Self> {
        let vocab: Vec<String> = serde_json::from_str(contents)?;
        Ok(Self::new(vocab))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        let bytes = match parse_byte_token(token) {
            Some(byte) => vec![byte],
            None => token.as_bytes().to_vec(),
        };
        self.index.get(&bytes).copied()
    }
}

fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    match hex.len() {
        2 => u8::from_str_radix(hex, 16).ok(),
        _ => None,
    }
}

impl Tokenizer for VocabTokenizer {
    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let bytes = text.as_bytes();
        let mut tokens = vec![];
        let mut start = 0;
        while start < bytes.len() {
            let longest = (1..=self.max_len.min(bytes.len() - start))
                .rev()
                .find_map(|len| self.index.get(&bytes[start..start + len]).map(|&id| (id, len)));
            match longest {
                Some((id, len)) => {
                    tokens.push(id);
                    start += len;
                }
                None => bail!("no token covers byte {} of {:?}", start, text),
            }
        }
        Ok(tokens)
    }

    fn decode(&self, tokens: &[u32]) -> Result<Vec<u8>> {
        let mut output = vec![];
        for &token in tokens {
            match self.tokens.get(token as usize) {
                Some(bytes) => output.extend_from_slice(bytes),
                None => bail!("token {} out of vocabulary", token),
            }
        }
        Ok(output)
    }
}

/// Forward step that steers generation through a fixed token script.
///
/// Each call returns logits peaked on the next scripted token; once the script runs out
/// the distribution is flat. Every token fed in is recorded.
#[derive(Debug, Clone)]
pub struct ScriptedForward {
    vocab_size: usize,
    script: Vec<u32>,
    cursor: usize,
    fed: Vec<u32>,
}

impl ScriptedForward {
    pub fn new(vocab_size: usize, script: Vec<u32>) -> Self {
        Self {
            vocab_size,
            script,
            cursor: 0,
            fed: vec![],
        }
    }

    /// Tokens passed to `prefill` and `forward` since the last context clear.
    pub fn fed(&self) -> &[u32] {
        &self.fed
    }

    pub fn remaining(&self) -> usize {
        self.script.len().saturating_sub(self.cursor)
    }

    fn next_logits(&mut self) -> Vec<f32> {
        let mut logits = vec![0.0; self.vocab_size];
        if let Some(&token) = self.script.get(self.cursor) {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit = SCRIPT_PEAK;
            }
            self.cursor += 1;
        }
        logits
    }
}

impl Forward for ScriptedForward {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn prefill(&mut self, tokens: &[u32], _payload: Option<&Payload>) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            bail!("prefill with no tokens");
        }
        self.fed.extend_from_slice(tokens);
        Ok(self.next_logits())
    }

    fn forward(&mut self, token: u32) -> Result<Vec<f32>> {
        if token as usize >= self.vocab_size {
            bail!("token {} out of vocabulary", token);
        }
        self.fed.push(token);
        Ok(self.next_logits())
    }

    fn clear_context(&mut self) {
        self.fed.clear();
    }
}
