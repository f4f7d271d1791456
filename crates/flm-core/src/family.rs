//! Per-family configuration: marker grammar, output wrapping and default shaping.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::{sampler::nucleus::SamplerParams, stream::StreamGrammar};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarVariant {
    #[default]
    Plain,
    Think,
    ToolCall,
    ThinkWithTools,
    Harmony,
    Pythonic,
    PythonicThink,
}

impl GrammarVariant {
    pub fn grammar(self) -> StreamGrammar {
        match self {
            GrammarVariant::Plain => StreamGrammar::plain(),
            GrammarVariant::Think => StreamGrammar::think(),
            GrammarVariant::ToolCall => StreamGrammar::tool_call(),
            GrammarVariant::ThinkWithTools => StreamGrammar::think_with_tools(),
            GrammarVariant::Harmony => StreamGrammar::harmony(),
            GrammarVariant::Pythonic => StreamGrammar::pythonic_tools(false),
            GrammarVariant::PythonicThink => StreamGrammar::pythonic_tools(true),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FamilyConfig {
    pub name: &'static str,
    pub grammar: GrammarVariant,
    pub sampler: SamplerParams,
    /// Written before the first generated token.
    pub output_prefix: &'static str,
    /// Written after generation stops.
    pub output_suffix: &'static str,
    /// Written after `output_prefix` while thinking is enabled.
    pub think_prefix: &'static str,
    /// Constrain the tool header after the commentary channel opens.
    pub constrained: bool,
    /// Texts of end-of-sequence tokens.
    pub eos: &'static [&'static str],
    /// Texts of other tokens that never produce visible output.
    pub specials: &'static [&'static str],
}

fn shaping(temperature: f32) -> SamplerParams {
    SamplerParams {
        temperature,
        top_k: 10,
        top_p: 0.95,
        repetition_penalty: 1.1,
        repeat_last_n: 1024,
        ..Default::default()
    }
}

fn family(name: &'static str, grammar: GrammarVariant) -> FamilyConfig {
    FamilyConfig {
        name,
        grammar,
        sampler: shaping(0.6),
        output_prefix: "",
        output_suffix: "",
        think_prefix: "",
        constrained: false,
        eos: &[],
        specials: &[],
    }
}

const LLAMA_EOS: &[&str] = &["<|eot_id|>", "<|end_of_text|>", "<|eom_id|>"];
const LLAMA_SPECIALS: &[&str] = &["<|begin_of_text|>"];
const QWEN_EOS: &[&str] = &["<|im_end|>", "<|endoftext|>"];
const GEMMA_EOS: &[&str] = &["<end_of_turn>", "<eos>"];
const GEMMA_SPECIALS: &[&str] = &["<bos>"];
const DEEPSEEK_EOS: &[&str] = &["<｜end▁of▁sentence｜>"];
const DEEPSEEK_SPECIALS: &[&str] = &["<｜begin▁of▁sentence｜>"];
const HARMONY_EOS: &[&str] = &["<|return|>", "<|call|>"];
const LFM_EOS: &[&str] = &["<|im_end|>"];
const LFM_SPECIALS: &[&str] = &["<|startoftext|>"];

/// Resolve a model tag such as `qwen3-tk` or `gpt-oss:20b` to its family configuration.
pub fn lookup(tag: &str) -> Result<FamilyConfig> {
    let tag = tag.trim().to_ascii_lowercase();
    let base = tag.split(':').next().unwrap_or_default();

    let config = match base {
        "llama3.1" | "llama3.2" => FamilyConfig {
            eos: LLAMA_EOS,
            specials: LLAMA_SPECIALS,
            ..family("llama3", GrammarVariant::ToolCall)
        },
        "deepseek-r1" => FamilyConfig {
            think_prefix: "<think>\n\n",
            eos: DEEPSEEK_EOS,
            specials: DEEPSEEK_SPECIALS,
            ..family("deepseek-r1", GrammarVariant::Think)
        },
        "qwen2" | "qwen2.5" => FamilyConfig {
            eos: QWEN_EOS,
            ..family("qwen2", GrammarVariant::ToolCall)
        },
        "qwen3" => FamilyConfig {
            eos: QWEN_EOS,
            ..family("qwen3", GrammarVariant::ThinkWithTools)
        },
        "qwen3-it" => FamilyConfig {
            eos: QWEN_EOS,
            ..family("qwen3-it", GrammarVariant::ToolCall)
        },
        "qwen3-tk" => FamilyConfig {
            think_prefix: "<think>\n\n",
            eos: QWEN_EOS,
            ..family("qwen3-tk", GrammarVariant::ThinkWithTools)
        },
        "qwen3vl" | "qwen3vl-it" => FamilyConfig {
            sampler: shaping(0.8),
            eos: QWEN_EOS,
            ..family("qwen3vl", GrammarVariant::ToolCall)
        },
        "qwen3vl-tk" => FamilyConfig {
            sampler: shaping(0.8),
            think_prefix: "<think>\n\n",
            eos: QWEN_EOS,
            ..family("qwen3vl-tk", GrammarVariant::ThinkWithTools)
        },
        "gemma3" | "medgemma" => FamilyConfig {
            eos: GEMMA_EOS,
            specials: GEMMA_SPECIALS,
            ..family("gemma3", GrammarVariant::Plain)
        },
        "gpt-oss" | "gpt-oss-sg" => FamilyConfig {
            output_prefix: "<|start|>assistant",
            output_suffix: "<|end|>",
            constrained: true,
            eos: HARMONY_EOS,
            ..family("gpt-oss", GrammarVariant::Harmony)
        },
        "lfm2" => FamilyConfig {
            sampler: shaping(0.3),
            eos: LFM_EOS,
            specials: LFM_SPECIALS,
            ..family("lfm2", GrammarVariant::Pythonic)
        },
        "lfm2.5-tk" => FamilyConfig {
            sampler: SamplerParams {
                top_p: 0.1,
                repetition_penalty: 1.05,
                ..shaping(0.1)
            },
            think_prefix: "<think>\n",
            eos: LFM_EOS,
            specials: LFM_SPECIALS,
            ..family("lfm2.5-tk", GrammarVariant::PythonicThink)
        },
        _ => bail!("unknown model tag: {tag}"),
    };
    Ok(config)
}
