//! Tool-call grammar enforcement.
//!
//! Once armed, the decoder walks a fixed sequence of literals
//! (`" to=functions."`, a registered tool name, `" <|constrain|>"` + `"json"`, `"<|message|>"`)
//! and masks every logit that cannot continue the current one.

use std::collections::HashSet;

use anyhow::Result;

use super::{Formatter, Sampler};
use crate::engine::Tokenizer;

pub const FUNCTION_MARKER: &str = " to=functions.";
pub const CONSTRAINT_MARKER: &str = " <|constrain|>";
pub const CONSTRAINT_FORMAT: &str = "json";
pub const PAYLOAD_MARKER: &str = "<|message|>";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrammarState {
    /// Not constraining; waiting for the loop to arm the decoder.
    #[default]
    Idle,
    ExpectFunctionMarker,
    ExpectFunctionName,
    ExpectConstraintMarker,
    ExpectPayloadMarker,
    /// The header is complete; the payload is sampled freely.
    Complete,
}

impl GrammarState {
    pub fn is_constraining(self) -> bool {
        !matches!(self, GrammarState::Idle | GrammarState::Complete)
    }
}

/// Set every logit outside `allowed` to negative infinity.
pub fn mask_logits(logits: &mut [f32], allowed: &HashSet<u32>) {
    logits
        .iter_mut()
        .enumerate()
        .filter(|(id, _)| !allowed.contains(&(*id as u32)))
        .for_each(|(_, x)| *x = f32::NEG_INFINITY);
}

#[derive(Debug, Clone)]
pub struct ConstrainedDecoder {
    state: GrammarState,
    accumulated: String,
    tool_names: Vec<String>,
    /// Decoded text of every token id.
    vocab: Vec<String>,
    name_tokens: HashSet<u32>,
    constraint_tokens: HashSet<u32>,
    payload_tokens: HashSet<u32>,
    steps: usize,
    max_steps: usize,
}

impl ConstrainedDecoder {
    pub fn new(tokenizer: &dyn Tokenizer, max_steps: usize) -> Result<Self> {
        let vocab = (0..tokenizer.vocab_size() as u32)
            .map(|id| {
                tokenizer
                    .decode(&[id])
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })
            .collect::<Result<Vec<_>>>()?;

        let constraint_tokens = [CONSTRAINT_MARKER, CONSTRAINT_FORMAT]
            .into_iter()
            .map(|literal| tokenizer.encode(literal))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        let payload_tokens = tokenizer.encode(PAYLOAD_MARKER)?.into_iter().collect();

        Ok(Self {
            state: GrammarState::Idle,
            accumulated: String::new(),
            tool_names: vec![],
            vocab,
            name_tokens: HashSet::new(),
            constraint_tokens,
            payload_tokens,
            steps: 0,
            max_steps,
        })
    }

    /// Register the tools of the current request.
    pub fn set_tools(&mut self, tokenizer: &dyn Tokenizer, names: &[String]) -> Result<()> {
        let mut tool_names: Vec<String> = Vec::with_capacity(names.len());
        let mut name_tokens = HashSet::new();
        for name in names {
            if tool_names.contains(name) {
                continue;
            }
            name_tokens.extend(tokenizer.encode(name)?);
            tool_names.push(name.clone());
        }
        self.tool_names = tool_names;
        self.name_tokens = name_tokens;
        Ok(())
    }

    pub fn tool_names(&self) -> &[String] {
        &self.tool_names
    }

    #[inline]
    pub fn state(&self) -> GrammarState {
        self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state.is_constraining()
    }

    pub fn set_max_steps(&mut self, max_steps: usize) {
        self.max_steps = max_steps;
    }

    /// Start enforcing the grammar. Does nothing without registered tools.
    pub fn arm(&mut self) -> bool {
        if self.tool_names.is_empty() {
            return false;
        }
        log::info!("[grammar][arm]");
        self.transition(GrammarState::ExpectFunctionMarker);
        self.steps = 0;
        true
    }

    /// Return to `Idle`.
    pub fn reset(&mut self) {
        self.state = GrammarState::Idle;
        self.accumulated.clear();
        self.steps = 0;
    }

    /// Token ids admissible in the current state, or `None` if unconstrained.
    pub fn allowed_ids(&self) -> Option<HashSet<u32>> {
        match self.state {
            GrammarState::Idle | GrammarState::Complete => None,
            GrammarState::ExpectFunctionMarker => {
                let remaining = FUNCTION_MARKER
                    .strip_prefix(self.accumulated.as_str())
                    .unwrap_or(FUNCTION_MARKER);
                let allowed = self
                    .vocab
                    .iter()
                    .enumerate()
                    .filter(|(_, text)| !text.is_empty() && remaining.starts_with(text.as_str()))
                    .map(|(id, _)| id as u32)
                    .collect();
                Some(allowed)
            }
            GrammarState::ExpectFunctionName => Some(self.name_tokens.clone()),
            GrammarState::ExpectConstraintMarker => Some(self.constraint_tokens.clone()),
            GrammarState::ExpectPayloadMarker => Some(self.payload_tokens.clone()),
        }
    }

    /// Mask the logits to the admissible set and let `sampler` choose.
    pub fn step(&mut self, logits: &mut [f32], sampler: &mut impl Sampler) -> u32 {
        if self.allowed_ids().is_some_and(|allowed| allowed.is_empty()) {
            log::warn!("[grammar][abort] no admissible token in {:?}", self.state);
            self.reset();
        }
        self.transform(logits);
        sampler.sample(logits)
    }

    fn transition(&mut self, next: GrammarState) {
        log::info!("[grammar][{:?}] -> {:?}", self.state, next);
        self.state = next;
        self.accumulated.clear();
    }
}

impl Formatter for ConstrainedDecoder {
    fn transform(&self, output: &mut [f32]) {
        if let Some(allowed) = self.allowed_ids().filter(|allowed| !allowed.is_empty()) {
            mask_logits(output, &allowed);
        }
    }

    fn update(&mut self, _token: u32, text: &str) -> bool {
        if !self.state.is_constraining() {
            return false;
        }

        self.accumulated.push_str(text);
        self.steps += 1;

        let next = match self.state {
            GrammarState::ExpectFunctionMarker => self
                .accumulated
                .ends_with(FUNCTION_MARKER)
                .then_some(GrammarState::ExpectFunctionName),
            GrammarState::ExpectFunctionName => self
                .tool_names
                .iter()
                .any(|name| *name == self.accumulated)
                .then_some(GrammarState::ExpectConstraintMarker),
            GrammarState::ExpectConstraintMarker => text
                .contains(CONSTRAINT_FORMAT)
                .then_some(GrammarState::ExpectPayloadMarker),
            GrammarState::ExpectPayloadMarker => text
                .contains(PAYLOAD_MARKER)
                .then_some(GrammarState::Complete),
            GrammarState::Idle | GrammarState::Complete => None,
        };

        match next {
            Some(next) => self.transition(next),
            None if self.steps >= self.max_steps => {
                log::warn!(
                    "[grammar][stall] {:?} after {} steps, accumulated {:?}",
                    self.state,
                    self.steps,
                    self.accumulated
                );
                self.reset();
            }
            None => {}
        }

        self.state == GrammarState::Complete
    }
}
