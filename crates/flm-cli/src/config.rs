use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use derivative::Derivative;
use flm_core::{
    engine::Tokenizer,
    family,
    options::SessionOptions,
    replay::{ScriptedForward, VocabTokenizer},
    run::Session,
    sampler::nucleus::SamplerParams,
    Tool,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: Model,
    /// Overrides the family's default shaping when present.
    pub sampler: Option<SamplerParams>,
    pub tools: Vec<Tool>,
    pub prompt: PromptOption,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Model {
    /// Model tag, such as `qwen3-tk` or `gpt-oss:20b`.
    #[derivative(Default(value = "\"qwen3\".into()"))]
    pub tag: String,
    /// JSON array of token strings, in id order.
    #[derivative(Default(value = "\"assets/demo/vocab.json\".into()"))]
    pub vocab_path: PathBuf,
    /// JSON array of token strings the forward step replays.
    #[derivative(Default(value = "\"assets/demo/script.json\".into()"))]
    pub script_path: PathBuf,
    /// Context ceiling in tokens.
    #[derivative(Default(value = "4096"))]
    #[serde(alias = "max_l")]
    pub max_length: usize,
    #[derivative(Default(value = "true"))]
    pub enable_think: bool,
    #[derivative(Default(value = "64"))]
    pub constrained_step_limit: usize,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct PromptOption {
    /// Rendered prompt sent when none is given on the command line.
    #[derivative(Default(value = "\"User: hello\".into()"))]
    pub text: String,
    /// Output token limit; `0` means unbounded.
    pub max_tokens: usize,
}

impl From<&Config> for SessionOptions {
    fn from(value: &Config) -> Self {
        let Config {
            model:
                Model {
                    max_length,
                    enable_think,
                    constrained_step_limit,
                    ..
                },
            sampler,
            ..
        } = value;

        Self {
            max_length: *max_length,
            sampler: sampler.clone(),
            enable_think: *enable_think,
            constrained_step_limit: *constrained_step_limit,
            ..Default::default()
        }
    }
}

/// Build a replay session from the vocabulary and script files the config points at.
pub async fn load_session(config: &Config) -> Result<Session> {
    let family = family::lookup(&config.model.tag)?;

    let contents = tokio::fs::read_to_string(&config.model.vocab_path).await?;
    let tokenizer = VocabTokenizer::from_json(&contents)?;

    let contents = tokio::fs::read_to_string(&config.model.script_path).await?;
    let texts: Vec<String> = serde_json::from_str(&contents)?;
    let mut script = Vec::with_capacity(texts.len());
    for text in texts {
        match tokenizer.token_to_id(&text) {
            Some(token) => script.push(token),
            None => bail!("script token {text:?} not in vocabulary"),
        }
    }

    let forward = ScriptedForward::new(tokenizer.vocab_size(), script);
    Session::new(
        Box::new(forward),
        Arc::new(tokenizer),
        family,
        config.into(),
    )
}
