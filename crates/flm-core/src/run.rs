use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use derivative::Derivative;

use crate::{
    engine::{Forward, IncrementalDecoder, Payload, Tokenizer},
    family::FamilyConfig,
    options::{Parameter, SessionOptions},
    sampler::{constrained::ConstrainedDecoder, nucleus::NucleusSampler, Formatter, Sampler},
    stream::{Parsed, StreamClassifier},
    GenerationMeta, RuntimeInfo, StopReason, Token,
};

/// Tail of the generated text that arms the tool header grammar.
pub const GRAMMAR_TRIGGER: &str = "<|channel|>commentary";

#[derive(Debug, Default, Clone)]
pub struct GenerateOptions {
    /// Generated token limit; `0` means unbounded.
    pub length_limit: usize,
    /// Route text through the stream classifier instead of emitting it raw.
    pub classify: bool,
    /// Bias added to tokens before sampling.
    pub bias: HashMap<u32, f32>,
}

#[derive(Debug, Clone)]
enum Pending {
    /// Prefill logits the first token of the response is still to be drawn from.
    Logits(Vec<f32>),
    Token {
        token: u32,
        /// Whether the token already reached the output.
        emitted: bool,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct Prefill {
    tokens: usize,
    duration: Duration,
}

/// Collects generated text and forwards it to the caller, raw or classified.
struct Output<S: FnMut(Token)> {
    text: String,
    classifier: Option<StreamClassifier>,
    decoder: IncrementalDecoder,
    sink: S,
}

impl<S: FnMut(Token)> Output<S> {
    fn write(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.text.push_str(fragment);
        match &mut self.classifier {
            Some(classifier) => classifier
                .push(fragment)
                .into_iter()
                .for_each(|event| (self.sink)(Token::Event(event))),
            None => (self.sink)(Token::Content(fragment.into())),
        }
    }

    fn finish(mut self, suffix: &str) -> String {
        let tail = self.decoder.flush();
        self.write(&tail);
        self.write(suffix);
        if let Some(classifier) = &mut self.classifier {
            classifier
                .finish()
                .into_iter()
                .for_each(|event| (self.sink)(Token::Event(event)));
        }
        self.text
    }
}

/// One conversation with one model: owns the sampler, the tool grammar and the context
/// counters, and drives the forward step token by token.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Session {
    #[derivative(Debug = "ignore")]
    forward: Box<dyn Forward + Send>,
    #[derivative(Debug = "ignore")]
    tokenizer: Arc<dyn Tokenizer + Send + Sync>,
    family: FamilyConfig,
    options: SessionOptions,
    sampler: NucleusSampler,
    decoder: Option<ConstrainedDecoder>,
    eos: HashSet<u32>,
    specials: HashSet<u32>,
    total_tokens: usize,
    pending: Option<Pending>,
    prefill: Option<Prefill>,
    /// Classifier state of the response in progress; survives a resume.
    stream: Option<StreamClassifier>,
    utf8: IncrementalDecoder,
    /// Whether the response in progress already carries its prefixes.
    started: bool,
}

impl Session {
    pub fn new(
        forward: Box<dyn Forward + Send>,
        tokenizer: Arc<dyn Tokenizer + Send + Sync>,
        family: FamilyConfig,
        options: SessionOptions,
    ) -> Result<Self> {
        let vocab_size = forward.vocab_size();
        if tokenizer.vocab_size() > vocab_size {
            bail!(
                "tokenizer vocabulary ({}) exceeds model vocabulary ({})",
                tokenizer.vocab_size(),
                vocab_size
            );
        }

        let params = options
            .sampler
            .clone()
            .unwrap_or_else(|| family.sampler.clone());
        let sampler = NucleusSampler::new(vocab_size, params);

        let decoder = match family.constrained {
            true => Some(ConstrainedDecoder::new(
                tokenizer.as_ref(),
                options.constrained_step_limit,
            )?),
            false => None,
        };

        let resolve = |texts: &[&str]| -> HashSet<u32> {
            texts
                .iter()
                .filter_map(|text| match tokenizer.encode(text) {
                    Ok(tokens) if tokens.len() == 1 => Some(tokens[0]),
                    _ => {
                        log::info!("[session] special token {text:?} not in vocabulary");
                        None
                    }
                })
                .collect()
        };
        let mut eos = resolve(family.eos);
        eos.extend(options.eos.iter().copied());
        let mut specials = resolve(family.specials);
        specials.extend(eos.iter().copied());

        log::info!(
            "[session] family: {}, vocab: {}, eos: {:?}",
            family.name,
            vocab_size,
            eos
        );

        Ok(Self {
            forward,
            tokenizer,
            family,
            options,
            sampler,
            decoder,
            eos,
            specials,
            total_tokens: 0,
            pending: None,
            prefill: None,
            stream: None,
            utf8: IncrementalDecoder::new(),
            started: false,
        })
    }

    #[inline]
    pub fn family(&self) -> &FamilyConfig {
        &self.family
    }

    #[inline]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    #[inline]
    pub fn sampler(&self) -> &NucleusSampler {
        &self.sampler
    }

    #[inline]
    pub fn decoder(&self) -> Option<&ConstrainedDecoder> {
        self.decoder.as_ref()
    }

    #[inline]
    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    /// The token sampled last and not yet fed to the forward step.
    ///
    /// `None` right after a prefill: the first token is drawn by the next generate call.
    pub fn last_token(&self) -> Option<u32> {
        match self.pending {
            Some(Pending::Token { token, .. }) => Some(token),
            _ => None,
        }
    }

    pub fn tokenizer(&self) -> Arc<dyn Tokenizer + Send + Sync> {
        self.tokenizer.clone()
    }

    pub fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            family: self.family.name.to_string(),
            options: self.options.clone(),
            sampler: self.sampler.params.clone(),
            vocab_size: self.forward.vocab_size(),
            total_tokens: self.total_tokens,
        }
    }

    /// Apply a runtime setting. Invalid values are logged and leave the session untouched.
    pub fn configure(&mut self, parameter: Parameter) -> bool {
        if let Err(err) = parameter.validate() {
            log::warn!("[configure][reject] {err}");
            return false;
        }
        if let Parameter::RepetitionPenalty(x) = parameter {
            if x < 1.0 {
                log::warn!("[configure] repetition_penalty {x} < 1 rewards repetition");
            }
        }

        match parameter {
            Parameter::MaxLength(x) => self.options.max_length = x,
            Parameter::EnableThink(x) => self.options.enable_think = x,
            Parameter::Seed(x) => self.sampler.reseed(x),
            Parameter::ConstrainedStepLimit(x) => {
                self.options.constrained_step_limit = x;
                if let Some(decoder) = &mut self.decoder {
                    decoder.set_max_steps(x);
                }
            }
            _ => {
                let mut params = self.sampler.params.clone();
                parameter.apply(&mut params);
                self.sampler.set_params(params);
            }
        }
        log::info!("[configure] {parameter:?}");
        true
    }

    /// Split a finished response into reasoning, content and tool calls.
    pub fn parse(&self, text: &str) -> Parsed {
        StreamClassifier::parse(self.family.grammar.grammar(), text)
    }

    /// Register the tools the constrained grammar may name.
    pub fn set_tools(&mut self, names: &[String]) -> Result<()> {
        if let Some(decoder) = &mut self.decoder {
            decoder.set_tools(self.tokenizer.as_ref(), names)?;
        }
        Ok(())
    }

    /// Restore penalty history from text the model produced earlier.
    pub fn prime(&mut self, model_text: &str) -> Result<()> {
        let tokens = self.tokenizer.encode(model_text)?;
        self.sampler.init(&tokens);
        Ok(())
    }

    /// Start a new conversation: forget the context and the penalty history.
    pub fn clear_context(&mut self) {
        self.total_tokens = 0;
        self.pending = None;
        self.prefill = None;
        self.forward.clear_context();
        self.sampler.reset();
        self.start_response();
        log::info!("[session] context cleared");
    }

    /// Drop the classifier, the UTF-8 tail and the grammar state of the previous response.
    fn start_response(&mut self) {
        self.stream = None;
        self.utf8 = IncrementalDecoder::new();
        self.started = false;
        if let Some(decoder) = &mut self.decoder {
            decoder.reset();
        }
    }

    /// Prefill a rendered prompt. The first token is drawn from its logits by the next
    /// generate call, with that call's bias.
    pub fn insert(&mut self, prompt: &str, payload: Option<&Payload>) -> Result<()> {
        let tokens = self.tokenizer.encode(prompt)?;
        if tokens.is_empty() {
            bail!("empty prompt");
        }
        if self.total_tokens + tokens.len() >= self.options.max_length {
            bail!(
                "prompt of {} tokens exceeds the context ({} of {} used)",
                tokens.len(),
                self.total_tokens,
                self.options.max_length
            );
        }

        let instant = Instant::now();
        let logits = self.forward.prefill(&tokens, payload)?;
        self.total_tokens += tokens.len() + 1;

        self.start_response();
        self.pending = Some(Pending::Logits(logits));
        self.prefill = Some(Prefill {
            tokens: tokens.len(),
            duration: instant.elapsed(),
        });

        log::info!(
            "[insert] {} tokens, context {}/{}",
            tokens.len(),
            self.total_tokens,
            self.options.max_length
        );
        Ok(())
    }

    /// Continue generation from an explicit token that has not been emitted yet.
    pub fn generate_from<C, S>(
        &mut self,
        initial_token: u32,
        options: &GenerateOptions,
        cancel: C,
        sink: S,
    ) -> Result<(String, GenerationMeta)>
    where
        C: FnMut() -> bool,
        S: FnMut(Token),
    {
        self.pending = Some(Pending::Token {
            token: initial_token,
            emitted: false,
        });
        self.generate(options, cancel, sink)
    }

    /// Generate until a stop condition, streaming text into `sink`.
    pub fn generate<C, S>(
        &mut self,
        options: &GenerateOptions,
        mut cancel: C,
        sink: S,
    ) -> Result<(String, GenerationMeta)>
    where
        C: FnMut() -> bool,
        S: FnMut(Token),
    {
        let Some(pending) = self.pending.take() else {
            bail!("nothing to continue from; insert a prompt first");
        };

        let instant = Instant::now();
        let prefill = self.prefill.take().unwrap_or_default();
        let mut meta = GenerationMeta {
            prompt_tokens: prefill.tokens,
            prefill_duration: prefill.duration,
            ..Default::default()
        };

        let classifier = match options.classify {
            true => self
                .stream
                .take()
                .or_else(|| Some(StreamClassifier::new(self.family.grammar.grammar()))),
            false => None,
        };
        let mut output = Output {
            text: String::new(),
            classifier,
            decoder: std::mem::take(&mut self.utf8),
            sink,
        };
        if !self.started {
            self.started = true;
            output.write(self.family.output_prefix);
            if self.options.enable_think {
                output.write(self.family.think_prefix);
            }
        }

        let (mut last, mut stop) = match pending {
            Pending::Logits(mut logits) => {
                let token = self.sample(&mut logits, &options.bias);
                (token, self.accept(token, options, &mut output, &mut meta)?)
            }
            Pending::Token {
                token,
                emitted: false,
            } => (token, self.accept(token, options, &mut output, &mut meta)?),
            Pending::Token { token, .. } => (token, None),
        };

        let reason = loop {
            if let Some(reason) = stop {
                break reason;
            }
            if cancel() {
                break StopReason::Cancelled;
            }
            if self.total_tokens >= self.options.max_length {
                break StopReason::ContextCeiling;
            }

            let mut logits = self.forward.forward(last)?;
            let token = self.sample(&mut logits, &options.bias);
            self.total_tokens += 1;
            last = token;

            stop = self.accept(token, options, &mut output, &mut meta)?;
        };

        // only the end of sequence closes the response; any other stop may be resumed
        let text = match reason {
            StopReason::EndOfSequence => {
                self.pending = None;
                self.stream = None;
                self.started = false;
                output.finish(self.family.output_suffix)
            }
            _ => {
                self.pending = Some(Pending::Token {
                    token: last,
                    emitted: true,
                });
                let Output {
                    text,
                    classifier,
                    decoder,
                    ..
                } = output;
                self.stream = classifier;
                self.utf8 = decoder;
                text
            }
        };

        meta.stop_reason = reason;
        meta.decoding_duration = instant.elapsed();
        meta.total_duration = meta.prefill_duration + meta.decoding_duration;

        log::info!(
            "[generate][done] {:?}, prompt: {}, generated: {}, context: {}/{}",
            reason,
            meta.prompt_tokens,
            meta.generated_tokens,
            self.total_tokens,
            self.options.max_length
        );
        Ok((text, meta))
    }

    /// Add the bias and draw the next token, through the tool grammar while it is active.
    fn sample(&mut self, logits: &mut [f32], bias: &HashMap<u32, f32>) -> u32 {
        for (&token, &bias) in bias.iter() {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit += bias;
            }
        }
        match &mut self.decoder {
            Some(decoder) if decoder.is_active() => decoder.step(logits, &mut self.sampler),
            _ => self.sampler.sample(logits),
        }
    }

    /// Surface a freshly sampled token and decide whether generation stops on it.
    fn accept<S: FnMut(Token)>(
        &mut self,
        token: u32,
        options: &GenerateOptions,
        output: &mut Output<S>,
        meta: &mut GenerationMeta,
    ) -> Result<Option<StopReason>> {
        let bytes = self.tokenizer.decode(&[token])?;
        if !self.specials.contains(&token) {
            let fragment = output.decoder.push(&bytes);
            output.write(&fragment);
        }

        if let Some(decoder) = &mut self.decoder {
            if decoder.is_active() {
                let text = String::from_utf8_lossy(&bytes);
                if decoder.update(token, &text) {
                    log::info!("[grammar][complete]");
                    decoder.reset();
                }
            } else if output.text.ends_with(GRAMMAR_TRIGGER) {
                decoder.arm();
            }
        }

        if self.eos.contains(&token) {
            self.forward.forward(token)?;
            return Ok(Some(StopReason::EndOfSequence));
        }

        meta.generated_tokens += 1;
        if options.length_limit > 0 && meta.generated_tokens >= options.length_limit {
            return Ok(Some(StopReason::LengthLimit));
        }
        if self.total_tokens >= self.options.max_length {
            return Ok(Some(StopReason::ContextCeiling));
        }
        Ok(None)
    }
}
