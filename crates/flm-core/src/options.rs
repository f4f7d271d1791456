use anyhow::{bail, Result};
use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::sampler::nucleus::SamplerParams;

#[derive(Debug, Clone, PartialEq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct SessionOptions {
    /// Context ceiling in tokens, prompt included.
    #[derivative(Default(value = "4096"))]
    #[serde(alias = "max_l")]
    pub max_length: usize,
    /// Sampler parameters; the family defaults apply when absent.
    pub sampler: Option<SamplerParams>,
    /// Force the family's reasoning prefix, if it has one.
    #[derivative(Default(value = "true"))]
    pub enable_think: bool,
    /// Steps a constrained tool header may take before the grammar gives up.
    #[derivative(Default(value = "64"))]
    pub constrained_step_limit: usize,
    /// Additional end-of-sequence token ids.
    pub eos: Vec<u32>,
}

/// A recognized runtime setting with its typed value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value", rename_all = "snake_case")]
pub enum Parameter {
    Temperature(f32),
    TopK(usize),
    TopP(f32),
    MinP(f32),
    RepetitionPenalty(f32),
    FrequencyPenalty(f32),
    PresencePenalty(f32),
    RepeatLastN(usize),
    Seed(u64),
    MaxLength(usize),
    EnableThink(bool),
    ConstrainedStepLimit(usize),
}

impl Parameter {
    /// Reject values outside the accepted range.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Parameter::Temperature(x) if !(x >= 0.0 && x.is_finite()) => {
                bail!("temperature must be non-negative, got {x}")
            }
            Parameter::TopK(0) => bail!("top_k must be at least 1"),
            Parameter::TopP(x) if !(0.0..=1.0).contains(&x) => {
                bail!("top_p must be within [0, 1], got {x}")
            }
            Parameter::MinP(x) if !(0.0..=1.0).contains(&x) => {
                bail!("min_p must be within [0, 1], got {x}")
            }
            Parameter::RepetitionPenalty(x) if !(x >= 0.0 && x.is_finite()) => {
                bail!("repetition_penalty must be non-negative, got {x}")
            }
            Parameter::FrequencyPenalty(x) | Parameter::PresencePenalty(x) if !x.is_finite() => {
                bail!("penalty must be finite, got {x}")
            }
            Parameter::MaxLength(0) => bail!("max_length must be positive"),
            Parameter::ConstrainedStepLimit(0) => bail!("constrained_step_limit must be positive"),
            _ => Ok(()),
        }
    }

    /// Apply a shaping parameter. Returns `false` for parameters the sampler does not own.
    pub fn apply(&self, params: &mut SamplerParams) -> bool {
        match *self {
            Parameter::Temperature(x) => params.temperature = x,
            Parameter::TopK(x) => params.top_k = x,
            Parameter::TopP(x) => params.top_p = x,
            Parameter::MinP(x) => params.min_p = x,
            Parameter::RepetitionPenalty(x) => params.repetition_penalty = x,
            Parameter::FrequencyPenalty(x) => params.frequency_penalty = x,
            Parameter::PresencePenalty(x) => params.presence_penalty = x,
            Parameter::RepeatLastN(x) => params.repeat_last_n = x,
            Parameter::Seed(x) => params.seed = Some(x),
            Parameter::MaxLength(_)
            | Parameter::EnableThink(_)
            | Parameter::ConstrainedStepLimit(_) => return false,
        }
        true
    }
}
