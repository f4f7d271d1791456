use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use derivative::Derivative;
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::{
    engine::Payload,
    options::{Parameter, SessionOptions},
    run::{GenerateOptions, Session},
    sampler::nucleus::SamplerParams,
    stream::{Parsed, StreamEvent},
};

pub mod engine;
pub mod family;
pub mod options;
pub mod replay;
pub mod run;
pub mod sampler;
pub mod stream;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Start,
    /// Raw generated text, when classification is off.
    Content(String),
    /// Classified segment, when classification is on.
    Event(StreamEvent),
    /// The whole response of this call split into its parts, when requested.
    Parsed(Parsed),
    Stop(FinishReason, TokenCounter),
    Done,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCounter {
    #[serde(alias = "prompt_tokens")]
    pub prompt: usize,
    #[serde(alias = "completion_tokens")]
    pub completion: usize,
    #[serde(alias = "total_tokens")]
    pub total: usize,
    pub duration: Duration,
}

impl From<&GenerationMeta> for TokenCounter {
    fn from(meta: &GenerationMeta) -> Self {
        Self {
            prompt: meta.prompt_tokens,
            completion: meta.generated_tokens,
            total: meta.prompt_tokens + meta.generated_tokens,
            duration: meta.total_duration,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model ended its turn, or the caller stopped listening.
    #[default]
    Stop,
    /// Incomplete output due to the token limit or the context size.
    Length,
    /// Generation failed.
    Error,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Error => "error",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndOfSequence,
    LengthLimit,
    ContextCeiling,
    Cancelled,
}

impl From<StopReason> for FinishReason {
    fn from(value: StopReason) -> Self {
        match value {
            StopReason::EndOfSequence | StopReason::Cancelled => FinishReason::Stop,
            StopReason::LengthLimit | StopReason::ContextCeiling => FinishReason::Length,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMeta {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prefill_duration: Duration,
    pub decoding_duration: Duration,
    pub total_duration: Duration,
    pub stop_reason: StopReason,
}

impl GenerationMeta {
    pub fn finish_reason(&self) -> FinishReason {
        self.stop_reason.into()
    }
}

/// A tool the model may call.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tool {
    pub name: String,
    /// JSON schema of the arguments; not interpreted here.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub family: String,
    pub options: SessionOptions,
    pub sampler: SamplerParams,
    pub vocab_size: usize,
    pub total_tokens: usize,
}

#[derive(Clone, Derivative)]
#[derivative(Debug, Default)]
pub struct GenerateRequest {
    /// The rendered prompt for the model.
    pub prompt: String,
    /// Optional image or audio input.
    pub payload: Option<Payload>,
    /// All text the model output earlier, used to restore penalties.
    pub model_text: String,
    /// Output token limit; `0` means unbounded.
    pub max_tokens: usize,
    /// Tools the model may call.
    pub tools: Vec<Tool>,
    /// Bias added to tokens before sampling.
    pub bias: HashMap<u32, f32>,
    /// Stream classified segments instead of raw text.
    pub classify: bool,
    /// Also send the finished response as one [`Token::Parsed`].
    pub parse: bool,
    /// Start a new conversation before this prompt.
    pub clear_context: bool,
    /// Raised by the caller to stop generation early.
    #[derivative(Debug = "ignore")]
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone)]
pub enum ThreadRequest {
    /// Get the current runtime info.
    Info(Sender<RuntimeInfo>),
    /// Request the runtime to complete a prompt.
    Generate {
        request: Box<GenerateRequest>,
        sender: Sender<Token>,
    },
    /// Change one runtime setting.
    Configure {
        parameter: Parameter,
        sender: Option<Sender<bool>>,
    },
    /// Start a new conversation.
    ClearContext,
}

fn run_request(
    session: &mut Session,
    request: &GenerateRequest,
    sender: &Sender<Token>,
) -> Result<(String, GenerationMeta)> {
    if request.clear_context {
        session.clear_context();
    }
    let names: Vec<_> = request.tools.iter().map(|tool| tool.name.clone()).collect();
    session.set_tools(&names)?;
    if !request.model_text.is_empty() {
        session.prime(&request.model_text)?;
    }
    session.insert(&request.prompt, request.payload.as_ref())?;

    let options = GenerateOptions {
        length_limit: request.max_tokens,
        classify: request.classify,
        bias: request.bias.clone(),
    };
    let cancel = || {
        sender.is_disconnected()
            || request
                .cancel
                .as_ref()
                .is_some_and(|cancel| cancel.load(Ordering::Relaxed))
    };
    let sink = |token| {
        let _ = sender.send(token);
    };
    session.generate(&options, cancel, sink)
}

fn process(session: &mut Session, request: GenerateRequest, sender: &Sender<Token>) -> Result<()> {
    let _ = sender.send(Token::Start);

    match run_request(session, &request, sender) {
        Ok((text, meta)) => {
            if request.parse {
                let _ = sender.send(Token::Parsed(session.parse(&text)));
            }
            let _ = sender.send(Token::Stop(meta.finish_reason(), TokenCounter::from(&meta)));
            let _ = sender.send(Token::Done);
            Ok(())
        }
        Err(err) => {
            let _ = sender.send(Token::Stop(FinishReason::Error, TokenCounter::default()));
            let _ = sender.send(Token::Done);
            Err(err)
        }
    }
}

/// Serve requests against one session until every sender is dropped.
pub async fn model_route(session: Session, receiver: Receiver<ThreadRequest>) -> Result<()> {
    log::info!("[route] serving {}", session.family().name);
    let mut session = session;

    loop {
        let Ok(request) = receiver.recv_async().await else {
            log::info!("core exit");
            break Ok(());
        };

        match request {
            ThreadRequest::Info(sender) => {
                let _ = sender.send(session.info());
            }
            ThreadRequest::Configure { parameter, sender } => {
                let result = session.configure(parameter);
                if let Some(sender) = sender {
                    let _ = sender.send(result);
                }
            }
            ThreadRequest::ClearContext => session.clear_context(),
            ThreadRequest::Generate { request, sender } => {
                let (returned, result) = tokio::task::spawn_blocking(move || {
                    let result = process(&mut session, *request, &sender);
                    (session, result)
                })
                .await?;
                session = returned;

                match result {
                    Ok(()) => log::info!("[process][done]"),
                    Err(err) => log::error!("[process][error] {err:#}"),
                }
            }
        }
    }
}
