//! Incremental classification of generated text into reasoning, content and tool calls.
//!
//! Fragments arrive in arbitrary chunks. A marker split across chunks is held back in the
//! residual until it either completes or turns out to be plain text, so no event ever
//! carries part of a marker.

use serde::{Deserialize, Serialize};
use serde_json::{value::RawValue, Map, Value};

use crate::sampler::constrained::CONSTRAINT_MARKER;

pub const HARMONY_ANALYSIS: &str = "<|start|>assistant<|channel|>analysis<|message|>";
pub const HARMONY_FINAL: &str = "<|start|>assistant<|channel|>final<|message|>";
pub const HARMONY_TOOL: &str = "<|start|>assistant<|channel|>commentary to=functions.";
pub const HARMONY_END: &str = "<|end|>";
pub const HARMONY_CALL: &str = "<|call|>";
pub const HARMONY_MESSAGE: &str = "<|message|>";

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

pub const PYTHONIC_OPEN: &str = "<|tool_call_start|>";
pub const PYTHONIC_CLOSE: &str = "<|tool_call_end|>";

/// Content emitted in place of a tool call that could not be parsed.
pub const PARSE_ERROR: &str = "[Error parsing tool call]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text of the arguments.
    pub arguments: String,
}

/// A complete response split into its parts.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parsed {
    pub reasoning: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Extend<StreamEvent> for Parsed {
    fn extend<T: IntoIterator<Item = StreamEvent>>(&mut self, events: T) {
        for event in events {
            match event {
                StreamEvent::Waiting => {}
                StreamEvent::Reasoning(text) => self.reasoning.push_str(&text),
                StreamEvent::Content(text) => self.content.push_str(&text),
                StreamEvent::ToolDone(call) => self.tool_calls.push(call),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Nothing visible yet; a marker or a tool block is still being disambiguated.
    Waiting,
    Reasoning(String),
    Content(String),
    ToolDone(ToolCall),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamMode {
    #[default]
    WaitingForHeader,
    Reasoning,
    Content,
    ToolBuffering,
}

/// How the body of a tool section is split into name and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolPayload {
    /// `name<separator>arguments`; anything from `" <|constrain|>"` on is dropped from the name.
    Separated(&'static str),
    /// `{"name": .., "arguments": ..}`.
    Json,
    /// `[name(key=value, ..)]`.
    Pythonic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionKind {
    Reasoning,
    Content,
    Tool(ToolPayload),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub open: &'static str,
    pub closes: Vec<&'static str>,
    pub kind: SectionKind,
}

/// Marker layout of one model family's raw output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGrammar {
    /// Mode outside of any section: `WaitingForHeader` drops text, `Content` emits it.
    pub idle: StreamMode,
    pub sections: Vec<Section>,
}

impl StreamGrammar {
    /// Multi-channel output: analysis, final and tool channels sharing one end marker.
    pub fn harmony() -> Self {
        Self {
            idle: StreamMode::WaitingForHeader,
            sections: vec![
                Section {
                    open: HARMONY_ANALYSIS,
                    closes: vec![HARMONY_END],
                    kind: SectionKind::Reasoning,
                },
                Section {
                    open: HARMONY_FINAL,
                    closes: vec![HARMONY_END],
                    kind: SectionKind::Content,
                },
                Section {
                    open: HARMONY_TOOL,
                    closes: vec![HARMONY_CALL, HARMONY_END],
                    kind: SectionKind::Tool(ToolPayload::Separated(HARMONY_MESSAGE)),
                },
            ],
        }
    }

    /// Content toggled into reasoning by `<think>` / `</think>`.
    pub fn think() -> Self {
        Self {
            idle: StreamMode::Content,
            sections: vec![think_section()],
        }
    }

    /// Content with `<tool_call>` JSON blocks.
    pub fn tool_call() -> Self {
        Self {
            idle: StreamMode::Content,
            sections: vec![tool_call_section()],
        }
    }

    pub fn think_with_tools() -> Self {
        Self {
            idle: StreamMode::Content,
            sections: vec![think_section(), tool_call_section()],
        }
    }

    /// Content with `<|tool_call_start|>[name(k=v)]<|tool_call_end|>` blocks.
    pub fn pythonic_tools(think: bool) -> Self {
        let mut sections = vec![];
        if think {
            sections.push(think_section());
        }
        sections.push(Section {
            open: PYTHONIC_OPEN,
            closes: vec![PYTHONIC_CLOSE],
            kind: SectionKind::Tool(ToolPayload::Pythonic),
        });
        Self {
            idle: StreamMode::Content,
            sections,
        }
    }

    /// Plain content with no markers at all.
    pub fn plain() -> Self {
        Self {
            idle: StreamMode::Content,
            sections: vec![],
        }
    }
}

fn think_section() -> Section {
    Section {
        open: THINK_OPEN,
        closes: vec![THINK_CLOSE],
        kind: SectionKind::Reasoning,
    }
}

fn tool_call_section() -> Section {
    Section {
        open: TOOL_CALL_OPEN,
        closes: vec![TOOL_CALL_CLOSE],
        kind: SectionKind::Tool(ToolPayload::Json),
    }
}

/// Earliest occurrence of any marker: `(position, marker index, marker length)`.
fn find_earliest<'a>(
    text: &str,
    markers: impl IntoIterator<Item = &'a str>,
) -> Option<(usize, usize, usize)> {
    markers
        .into_iter()
        .enumerate()
        .filter_map(|(index, marker)| text.find(marker).map(|pos| (pos, index, marker.len())))
        .min_by_key(|&(pos, index, _)| (pos, index))
}

/// Length of the longest suffix of `text` that is a proper prefix of some marker.
fn held_suffix<'a>(text: &str, markers: impl IntoIterator<Item = &'a str>) -> usize {
    markers
        .into_iter()
        .filter_map(|marker| {
            (1..marker.len())
                .rev()
                .filter(|&len| marker.is_char_boundary(len))
                .find(|&len| text.ends_with(&marker[..len]))
        })
        .max()
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct StreamClassifier {
    grammar: StreamGrammar,
    mode: StreamMode,
    section: Option<usize>,
    residual: String,
    rng: fastrand::Rng,
}

impl StreamClassifier {
    pub fn new(grammar: StreamGrammar) -> Self {
        Self::with_rng(grammar, fastrand::Rng::new())
    }

    /// Use a caller-provided generator for tool call ids.
    pub fn with_rng(grammar: StreamGrammar, rng: fastrand::Rng) -> Self {
        let mode = grammar.idle;
        Self {
            grammar,
            mode,
            section: None,
            residual: String::new(),
            rng,
        }
    }

    #[inline]
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    #[inline]
    pub fn residual(&self) -> &str {
        &self.residual
    }

    pub fn grammar(&self) -> &StreamGrammar {
        &self.grammar
    }

    /// Forget any buffered text and return to the idle mode.
    pub fn reset(&mut self) {
        self.mode = self.grammar.idle;
        self.section = None;
        self.residual.clear();
    }

    /// Feed one fragment and collect the events it completes.
    ///
    /// Returns a single [`StreamEvent::Waiting`] if nothing visible can be emitted yet.
    pub fn push(&mut self, fragment: &str) -> Vec<StreamEvent> {
        self.residual.push_str(fragment);

        let mut events = vec![];
        loop {
            let done = match self.section {
                None => self.step_idle(&mut events),
                Some(index) => self.step_section(index, &mut events),
            };
            if done {
                break;
            }
        }

        if events.is_empty() {
            events.push(StreamEvent::Waiting);
        }
        events
    }

    /// Flush everything still held at the end of the stream.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let residual = std::mem::take(&mut self.residual);
        let kind = self
            .section
            .map(|index| self.grammar.sections[index].kind.clone());

        let event = match kind {
            Some(SectionKind::Tool(_)) => {
                log::warn!("[stream][finish] unterminated tool block: {residual:?}");
                Some(StreamEvent::Content(PARSE_ERROR.into()))
            }
            Some(SectionKind::Reasoning) if !residual.is_empty() => {
                Some(StreamEvent::Reasoning(residual))
            }
            Some(SectionKind::Content) if !residual.is_empty() => {
                Some(StreamEvent::Content(residual))
            }
            None if self.grammar.idle == StreamMode::Content && !residual.is_empty() => {
                Some(StreamEvent::Content(residual))
            }
            _ => None,
        };

        self.reset();
        event.into_iter().collect()
    }

    /// Classify a finished response in one pass.
    pub fn parse(grammar: StreamGrammar, text: &str) -> Parsed {
        let mut classifier = Self::new(grammar);
        let mut parsed = Parsed::default();
        parsed.extend(classifier.push(text));
        parsed.extend(classifier.finish());
        parsed
    }

    /// Returns `true` once no further progress is possible on the current residual.
    fn step_idle(&mut self, events: &mut Vec<StreamEvent>) -> bool {
        let opens = self.grammar.sections.iter().map(|x| x.open);
        match find_earliest(&self.residual, opens) {
            Some((pos, index, len)) => {
                if self.grammar.idle == StreamMode::Content && pos > 0 {
                    events.push(StreamEvent::Content(self.residual[..pos].to_string()));
                }
                self.residual.drain(..pos + len);
                self.enter(index);
                false
            }
            None if self.grammar.idle == StreamMode::Content => {
                let opens = self.grammar.sections.iter().map(|x| x.open);
                let held = held_suffix(&self.residual, opens);
                self.flush(self.residual.len() - held, events);
                true
            }
            None => true,
        }
    }

    fn step_section(&mut self, index: usize, events: &mut Vec<StreamEvent>) -> bool {
        let section = &self.grammar.sections[index];
        match find_earliest(&self.residual, section.closes.iter().copied()) {
            Some((pos, _, len)) => {
                let body = self.residual[..pos].to_string();
                self.residual.drain(..pos + len);

                match section.kind.clone() {
                    SectionKind::Reasoning if !body.is_empty() => {
                        events.push(StreamEvent::Reasoning(body))
                    }
                    SectionKind::Content if !body.is_empty() => {
                        events.push(StreamEvent::Content(body))
                    }
                    SectionKind::Tool(payload) => events.push(self.parse_tool(&payload, &body)),
                    _ => {}
                }

                self.section = None;
                self.mode = self.grammar.idle;
                false
            }
            None if section.kind == SectionKind::Reasoning
                || section.kind == SectionKind::Content =>
            {
                let held = held_suffix(&self.residual, section.closes.iter().copied());
                self.flush(self.residual.len() - held, events);
                true
            }
            None => true,
        }
    }

    fn enter(&mut self, index: usize) {
        self.section = Some(index);
        self.mode = match self.grammar.sections[index].kind {
            SectionKind::Reasoning => StreamMode::Reasoning,
            SectionKind::Content => StreamMode::Content,
            SectionKind::Tool(_) => StreamMode::ToolBuffering,
        };
    }

    /// Emit the first `len` bytes of the residual tagged with the current mode.
    fn flush(&mut self, len: usize, events: &mut Vec<StreamEvent>) {
        if len == 0 {
            return;
        }
        let text: String = self.residual.drain(..len).collect();
        match self.mode {
            StreamMode::Reasoning => events.push(StreamEvent::Reasoning(text)),
            _ => events.push(StreamEvent::Content(text)),
        }
    }

    fn parse_tool(&mut self, payload: &ToolPayload, body: &str) -> StreamEvent {
        let parsed = match payload {
            ToolPayload::Separated(separator) => parse_separated(body, separator),
            ToolPayload::Json => parse_json(body),
            ToolPayload::Pythonic => parse_pythonic(body),
        };
        match parsed {
            Some((name, arguments)) => {
                let id = self.call_id();
                log::info!("[stream][tool] {name} ({id})");
                StreamEvent::ToolDone(ToolCall {
                    id,
                    name,
                    arguments,
                })
            }
            None => {
                log::warn!("[stream][tool] failed to parse: {body:?}");
                StreamEvent::Content(PARSE_ERROR.into())
            }
        }
    }

    fn call_id(&mut self) -> String {
        let suffix: String = (0..24).map(|_| self.rng.alphanumeric()).collect();
        format!("call_{suffix}")
    }
}

fn parse_separated(body: &str, separator: &str) -> Option<(String, String)> {
    let (head, arguments) = body.split_once(separator)?;
    let name = head.split(CONSTRAINT_MARKER).next().unwrap_or(head).trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), arguments.trim().to_string()))
}

#[derive(Debug, Deserialize)]
struct JsonCall<'a> {
    name: String,
    #[serde(borrow, default)]
    arguments: Option<&'a RawValue>,
}

fn parse_json(body: &str) -> Option<(String, String)> {
    let call: JsonCall = serde_json::from_str(body.trim()).ok()?;
    let arguments = call
        .arguments
        .map(|x| x.get().to_string())
        .unwrap_or_else(|| "{}".into());
    Some((call.name, arguments))
}

/// Parse `[name(key=value, ...)]` into a name and a JSON object of arguments.
fn parse_pythonic(body: &str) -> Option<(String, String)> {
    let body = body.trim().trim_start_matches('[').trim_end_matches(']').trim();
    let open = body.find('(')?;
    let name = body[..open].trim();
    if name.is_empty() {
        return None;
    }

    let close = matching_paren(body, open)?;
    let mut arguments = Map::new();
    for pair in split_top_level(&body[open + 1..close]) {
        let (key, value) = pair.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        arguments.insert(key.to_string(), pythonic_value(value.trim()));
    }

    let arguments = serde_json::to_string(&Value::Object(arguments)).ok()?;
    Some((name.to_string(), arguments))
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote = None;
    for (pos, c) in text.char_indices().skip_while(|&(pos, _)| pos < open) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(pos);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that are neither nested nor quoted. Blank pieces are dropped.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut pieces = vec![];
    let mut depth = 0usize;
    let mut quote = None;
    let mut start = 0;
    for (pos, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                pieces.push(&text[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
    }
    pieces.push(&text[start..]);
    pieces.retain(|x| !x.trim().is_empty());
    pieces
}

fn pythonic_value(text: &str) -> Value {
    let quoted = ['"', '\''].into_iter().find_map(|q| {
        text.strip_prefix(q)
            .and_then(|x| x.strip_suffix(q))
            .filter(|_| text.len() >= 2)
    });
    if let Some(inner) = quoted {
        return Value::String(inner.to_string());
    }
    match text {
        "True" | "true" => Value::Bool(true),
        "False" | "false" => Value::Bool(false),
        "None" | "null" => Value::Null,
        _ => serde_json::from_str::<Value>(text)
            .ok()
            .filter(|x| x.is_number() || x.is_array() || x.is_object())
            .unwrap_or_else(|| Value::String(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(grammar: StreamGrammar) -> StreamClassifier {
        StreamClassifier::with_rng(grammar, fastrand::Rng::with_seed(0))
    }

    /// Merge consecutive visible events of the same kind and blank out call ids.
    fn collapse(events: impl IntoIterator<Item = StreamEvent>) -> Vec<StreamEvent> {
        let mut merged: Vec<StreamEvent> = vec![];
        for event in events {
            match event {
                StreamEvent::Waiting => {}
                StreamEvent::Reasoning(y) => match merged.last_mut() {
                    Some(StreamEvent::Reasoning(x)) => x.push_str(&y),
                    _ => merged.push(StreamEvent::Reasoning(y)),
                },
                StreamEvent::Content(y) => match merged.last_mut() {
                    Some(StreamEvent::Content(x)) => x.push_str(&y),
                    _ => merged.push(StreamEvent::Content(y)),
                },
                StreamEvent::ToolDone(mut call) => {
                    call.id.clear();
                    merged.push(StreamEvent::ToolDone(call))
                }
            }
        }
        merged
    }

    fn run(grammar: StreamGrammar, chunks: &[&str]) -> Vec<StreamEvent> {
        let mut classifier = classifier(grammar);
        let mut events = vec![];
        for chunk in chunks {
            events.extend(classifier.push(chunk));
        }
        events.extend(classifier.finish());
        events
    }

    /// Split `text` at the given byte offsets, skipping ones inside a character.
    fn split_at<'a>(text: &'a str, cuts: &[usize]) -> Vec<&'a str> {
        let mut cuts = cuts
            .iter()
            .copied()
            .filter(|&x| x > 0 && x < text.len() && text.is_char_boundary(x))
            .collect::<Vec<_>>();
        cuts.sort_unstable();
        cuts.dedup();

        let mut chunks = vec![];
        let mut start = 0;
        for cut in cuts {
            chunks.push(&text[start..cut]);
            start = cut;
        }
        chunks.push(&text[start..]);
        chunks
    }

    #[test]
    fn think_split_inside_marker() {
        let mut classifier = classifier(StreamGrammar::think());
        assert_eq!(classifier.push("<thi"), vec![StreamEvent::Waiting]);
        assert_eq!(classifier.residual(), "<thi");
        assert_eq!(
            classifier.push("nk>reason</think>answer"),
            vec![
                StreamEvent::Reasoning("reason".into()),
                StreamEvent::Content("answer".into()),
            ]
        );
        assert_eq!(classifier.mode(), StreamMode::Content);
    }

    #[test]
    fn tool_call_json() {
        let events = run(
            StreamGrammar::tool_call(),
            &[r#"<tool_call>{"name": "get_weather", "arguments": {"city":"SF"}}</tool_call>"#],
        );
        let calls = events
            .iter()
            .filter_map(|x| match x {
                StreamEvent::ToolDone(call) => Some(call),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, r#"{"city":"SF"}"#);
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].id.len(), 29);
    }

    #[test]
    fn tool_block_is_held_until_closed() {
        let mut classifier = classifier(StreamGrammar::tool_call());
        assert_eq!(
            classifier.push("sure <tool_call>{\"name\": \"a\", "),
            vec![StreamEvent::Content("sure ".into())]
        );
        assert_eq!(classifier.mode(), StreamMode::ToolBuffering);
        assert_eq!(
            classifier.push("\"arguments\": {}}</tool"),
            vec![StreamEvent::Waiting]
        );
        let events = classifier.push("_call>done");
        assert!(matches!(
            &events[0],
            StreamEvent::ToolDone(call) if call.name == "a" && call.arguments == "{}"
        ));
        assert_eq!(events[1], StreamEvent::Content("done".into()));
    }

    #[test]
    fn malformed_tool_call_becomes_content() {
        let events = run(
            StreamGrammar::tool_call(),
            &["<tool_call>{not json}</tool_call>after"],
        );
        assert_eq!(
            collapse(events),
            vec![StreamEvent::Content(format!("{PARSE_ERROR}after"))]
        );
    }

    #[test]
    fn harmony_channels() {
        let text = format!(
            "{HARMONY_ANALYSIS}think hard{HARMONY_END}{HARMONY_FINAL}The answer{HARMONY_END}"
        );
        let events = run(StreamGrammar::harmony(), &[&text]);
        assert_eq!(
            collapse(events),
            vec![
                StreamEvent::Reasoning("think hard".into()),
                StreamEvent::Content("The answer".into()),
            ]
        );
    }

    #[test]
    fn harmony_waits_for_header() {
        let mut classifier = classifier(StreamGrammar::harmony());
        assert_eq!(classifier.push("<|start|>assistant"), vec![StreamEvent::Waiting]);
        assert_eq!(classifier.mode(), StreamMode::WaitingForHeader);
        assert_eq!(
            classifier.push("<|channel|>final<|message|>Hi"),
            vec![StreamEvent::Content("Hi".into())]
        );
        assert_eq!(classifier.mode(), StreamMode::Content);
    }

    #[test]
    fn harmony_tool_call() {
        let text = format!(
            "{HARMONY_TOOL}get_weather <|constrain|>json<|message|>{{\"city\":\"SF\"}}{HARMONY_END}"
        );
        let events = run(StreamGrammar::harmony(), &[&text]);
        let events: [StreamEvent; 1] = collapse(events).try_into().unwrap();
        let [StreamEvent::ToolDone(call)] = events else {
            panic!("expected a single tool call");
        };
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, r#"{"city":"SF"}"#);
    }

    #[test]
    fn harmony_tool_without_separator() {
        let text = format!("{HARMONY_TOOL}get_weather {{}}{HARMONY_CALL}");
        let events = run(StreamGrammar::harmony(), &[&text]);
        assert_eq!(
            collapse(events),
            vec![StreamEvent::Content(PARSE_ERROR.into())]
        );
    }

    #[test]
    fn pythonic_tool_call() {
        let events = run(
            StreamGrammar::pythonic_tools(false),
            &[r#"<|tool_call_start|>[get_weather(city="San Francisco, CA", days=3, metric=True)]<|tool_call_end|>"#],
        );
        let events: [StreamEvent; 1] = collapse(events).try_into().unwrap();
        let [StreamEvent::ToolDone(call)] = events else {
            panic!("expected a single tool call");
        };
        assert_eq!(call.name, "get_weather");
        let arguments: Value = serde_json::from_str(&call.arguments).unwrap();
        assert_eq!(
            arguments,
            serde_json::json!({"city": "San Francisco, CA", "days": 3, "metric": true})
        );
    }

    #[test]
    fn pythonic_without_bracket_is_an_error() {
        assert_eq!(parse_pythonic("[get_weather]"), None);
        assert_eq!(parse_pythonic("[(x=1)]"), None);
    }

    #[test]
    fn unterminated_tool_block_on_finish() {
        let events = run(StreamGrammar::tool_call(), &["<tool_call>{\"name\""]);
        assert_eq!(
            collapse(events),
            vec![StreamEvent::Content(PARSE_ERROR.into())]
        );
    }

    #[test]
    fn look_alike_text_is_released() {
        let mut classifier = classifier(StreamGrammar::think());
        assert_eq!(classifier.push("a <th"), vec![StreamEvent::Content("a ".into())]);
        assert_eq!(classifier.push("ere"), vec![StreamEvent::Content("<there".into())]);
    }

    #[test]
    fn multibyte_text_is_never_split() {
        let events = run(StreamGrammar::think(), &["<think>思考</think>答え<", "think>"]);
        assert_eq!(
            collapse(events),
            vec![
                StreamEvent::Reasoning("思考".into()),
                StreamEvent::Content("答え".into()),
            ]
        );
    }

    #[test]
    fn parse_think_response() {
        let text = "<think>\n\nplan</think>The answer";
        let parsed = StreamClassifier::parse(StreamGrammar::think(), text);
        assert_eq!(parsed.reasoning, "\n\nplan");
        assert_eq!(parsed.content, "The answer");
        assert!(parsed.tool_calls.is_empty());
    }

    #[test]
    fn parse_reasoning_then_tool_call() {
        let text = r#"<think>need weather</think><tool_call>{"name": "get_weather", "arguments": {"city": "SF"}}</tool_call>"#;
        let parsed = StreamClassifier::parse(StreamGrammar::think_with_tools(), text);
        assert_eq!(parsed.reasoning, "need weather");
        assert_eq!(parsed.content, "");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "get_weather");
        assert_eq!(parsed.tool_calls[0].arguments, r#"{"city": "SF"}"#);
    }

    #[test]
    fn parse_keeps_text_around_tool_calls() {
        let text = r#"Checking.<tool_call>{"name": "a", "arguments": {}}</tool_call><tool_call>{"name": "b", "arguments": {"x": 1}}</tool_call>"#;
        let parsed = StreamClassifier::parse(StreamGrammar::tool_call(), text);
        assert_eq!(parsed.content, "Checking.");
        let names = parsed
            .tool_calls
            .iter()
            .map(|x| x.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["a", "b"]);
        assert_ne!(parsed.tool_calls[0].id, parsed.tool_calls[1].id);
    }

    #[test]
    fn parse_harmony_response() {
        let text = format!(
            "{HARMONY_ANALYSIS}look it up{HARMONY_END}{HARMONY_TOOL}search <|constrain|>json<|message|>{{\"q\":\"rust\"}}{HARMONY_CALL}"
        );
        let parsed = StreamClassifier::parse(StreamGrammar::harmony(), &text);
        assert_eq!(parsed.reasoning, "look it up");
        assert_eq!(parsed.content, "");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "search");
        assert_eq!(parsed.tool_calls[0].arguments, r#"{"q":"rust"}"#);
    }

    #[test]
    fn parse_pythonic_response() {
        let text = r#"<think>ok</think>Sure.<|tool_call_start|>[get_weather(city="Paris")]<|tool_call_end|>"#;
        let parsed = StreamClassifier::parse(StreamGrammar::pythonic_tools(true), text);
        assert_eq!(parsed.reasoning, "ok");
        assert_eq!(parsed.content, "Sure.");
        assert_eq!(parsed.tool_calls[0].name, "get_weather");
        let arguments: Value = serde_json::from_str(&parsed.tool_calls[0].arguments).unwrap();
        assert_eq!(arguments, serde_json::json!({"city": "Paris"}));
    }

    #[test]
    fn parse_plain_and_unterminated() {
        let parsed = StreamClassifier::parse(StreamGrammar::plain(), "a <think> b");
        assert_eq!(parsed.content, "a <think> b");

        let text = "x<tool_call>{\"name\"";
        let parsed = StreamClassifier::parse(StreamGrammar::tool_call(), text);
        assert_eq!(parsed.content, format!("x{PARSE_ERROR}"));
        assert!(parsed.tool_calls.is_empty());
    }

    fn check_every_split(grammar: StreamGrammar, text: &str, expected: &[StreamEvent]) {
        for cut in 0..=text.len() {
            let chunks = split_at(text, &[cut]);
            assert_eq!(collapse(run(grammar.clone(), &chunks)), expected, "cut at {cut}");
        }

        let mut rng = fastrand::Rng::with_seed(17);
        for _ in 0..200 {
            let cuts = (0..rng.usize(1..8))
                .map(|_| rng.usize(0..=text.len()))
                .collect::<Vec<_>>();
            let chunks = split_at(text, &cuts);
            assert_eq!(collapse(run(grammar.clone(), &chunks)), expected, "cuts {cuts:?}");
        }
    }

    #[test]
    fn fragmentation_does_not_change_output() {
        check_every_split(
            StreamGrammar::think(),
            "<think>a<b</think>x</thinkY<think>z",
            &[
                StreamEvent::Reasoning("a<b".into()),
                StreamEvent::Content("x</thinkY".into()),
                StreamEvent::Reasoning("z".into()),
            ],
        );

        let harmony = format!(
            "{HARMONY_ANALYSIS}plan <|en{HARMONY_END}{HARMONY_FINAL}réponse{HARMONY_END}"
        );
        check_every_split(
            StreamGrammar::harmony(),
            &harmony,
            &[
                StreamEvent::Reasoning("plan <|en".into()),
                StreamEvent::Content("réponse".into()),
            ],
        );

        check_every_split(
            StreamGrammar::think_with_tools(),
            "<think>r</think>pre<tool_call>{\"name\":\"f\",\"arguments\":{\"q\":1}}</tool_call>post",
            &[
                StreamEvent::Reasoning("r".into()),
                StreamEvent::Content("pre".into()),
                StreamEvent::ToolDone(ToolCall {
                    id: String::new(),
                    name: "f".into(),
                    arguments: "{\"q\":1}".into(),
                }),
                StreamEvent::Content("post".into()),
            ],
        );
    }
}
