#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use flm_core::{
    engine::{Forward, Payload},
    family,
    options::SessionOptions,
    replay::{ScriptedForward, VocabTokenizer},
    run::Session,
    sampler::nucleus::SamplerParams,
    stream::StreamEvent,
    Token,
};

/// Scripted forward step that also records what it was fed into a shared log.
pub struct Recording {
    inner: ScriptedForward,
    log: Arc<Mutex<Vec<u32>>>,
}

impl Forward for Recording {
    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn prefill(&mut self, tokens: &[u32], payload: Option<&Payload>) -> Result<Vec<f32>> {
        self.log.lock().unwrap().extend_from_slice(tokens);
        self.inner.prefill(tokens, payload)
    }

    fn forward(&mut self, token: u32) -> Result<Vec<f32>> {
        self.log.lock().unwrap().push(token);
        self.inner.forward(token)
    }

    fn clear_context(&mut self) {
        self.log.lock().unwrap().clear();
        self.inner.clear_context();
    }
}

pub struct Fixture {
    pub session: Session,
    pub tokenizer: Arc<VocabTokenizer>,
    pub fed: Arc<Mutex<Vec<u32>>>,
}

impl Fixture {
    pub fn id(&self, text: &str) -> u32 {
        self.tokenizer.token_to_id(text).unwrap()
    }

    pub fn ids(&self, texts: &[&str]) -> Vec<u32> {
        texts.iter().map(|text| self.id(text)).collect()
    }

    pub fn fed(&self) -> Vec<u32> {
        self.fed.lock().unwrap().clone()
    }
}

/// Greedy sampling with no penalties, so the script fully decides the output.
pub fn greedy(max_length: usize) -> SessionOptions {
    SessionOptions {
        max_length,
        sampler: Some(SamplerParams {
            top_k: 1,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build a session for `tag` whose forward step peaks on `script`, one entry per call.
pub fn fixture(tag: &str, vocab: &[&str], script: &[&str], options: SessionOptions) -> Fixture {
    let tokenizer = Arc::new(VocabTokenizer::new(
        vocab.iter().map(|x| x.to_string()).collect(),
    ));
    let script = script
        .iter()
        .map(|text| tokenizer.token_to_id(text).unwrap())
        .collect();
    let fed = Arc::new(Mutex::new(vec![]));
    let forward = Recording {
        inner: ScriptedForward::new(vocab.len(), script),
        log: fed.clone(),
    };
    let family = family::lookup(tag).unwrap();
    let session = Session::new(Box::new(forward), tokenizer.clone(), family, options).unwrap();
    Fixture {
        session,
        tokenizer,
        fed,
    }
}

pub fn raw_text(tokens: &[Token]) -> String {
    tokens
        .iter()
        .filter_map(|token| match token {
            Token::Content(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Classified events with `Waiting` dropped.
pub fn visible_events(tokens: &[Token]) -> Vec<StreamEvent> {
    tokens
        .iter()
        .filter_map(|token| match token {
            Token::Event(StreamEvent::Waiting) => None,
            Token::Event(event) => Some(event.clone()),
            _ => None,
        })
        .collect()
}

pub const QWEN_VOCAB: &[&str] = &[
    "<|im_end|>",
    "<|endoftext|>",
    "<think>",
    "</think>",
    "reason",
    "answer",
    "hello",
    " ",
    "world",
    "User:",
    "<tool_call>",
    "</tool_call>",
    "{\"name\": \"search\", \"arguments\": {}}",
];

pub const HARMONY_VOCAB: &[&str] = &[
    "<|return|>",
    "<|call|>",
    "<|channel|>",
    "commentary",
    " to=functions.",
    "get_weather",
    " <|constrain|>",
    "json",
    "<|message|>",
    "{}",
    "hello",
    "<|end|>",
    "search",
];
