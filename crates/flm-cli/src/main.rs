use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use clap::{command, CommandFactory, Parser};
use flm_core::{model_route, stream::StreamEvent, GenerateRequest, ThreadRequest, Token};
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};

mod config;

pub async fn load_config(path: impl AsRef<Path>) -> Result<config::Config> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(toml::from_str(&contents)?)
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Rendered prompt; overrides the one in the config.
    #[arg(long, short)]
    prompt: Option<String>,
    #[arg(long, short)]
    max_tokens: Option<usize>,
    /// Print the raw output instead of classified segments.
    #[arg(long)]
    raw: bool,
    /// Print only the finished response, as one JSON object.
    #[arg(long)]
    json: bool,
}

fn print(token: &Token, stdout: &mut impl Write) -> Result<()> {
    match token {
        Token::Start | Token::Done | Token::Event(StreamEvent::Waiting) => {}
        Token::Content(text) | Token::Event(StreamEvent::Content(text)) => {
            write!(stdout, "{text}")?
        }
        Token::Event(StreamEvent::Reasoning(text)) => write!(stdout, "\x1b[2m{text}\x1b[0m")?,
        Token::Event(StreamEvent::ToolDone(call)) => {
            writeln!(stdout, "\n[tool] {}", serde_json::to_string(call)?)?
        }
        Token::Parsed(parsed) => writeln!(stdout, "{}", serde_json::to_string(parsed)?)?,
        Token::Stop(reason, counter) => writeln!(
            stdout,
            "\n[{}] prompt: {}, completion: {}, total: {}, {:?}",
            reason.as_str(),
            counter.prompt,
            counter.completion,
            counter.total,
            counter.duration
        )?,
    }
    stdout.flush()?;
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let path = args
        .config
        .clone()
        .unwrap_or("assets/configs/Config.toml".into());
    log::info!("reading config {}...", path.to_string_lossy());
    let config = load_config(path).await?;

    let session = config::load_session(&config).await?;
    let (sender, receiver) = flume::unbounded::<ThreadRequest>();
    let handle = tokio::spawn(model_route(session, receiver));

    let request = GenerateRequest {
        prompt: args.prompt.unwrap_or(config.prompt.text),
        max_tokens: args.max_tokens.unwrap_or(config.prompt.max_tokens),
        tools: config.tools,
        classify: !args.raw && !args.json,
        parse: args.json,
        ..Default::default()
    };
    let (token_sender, token_receiver) = flume::unbounded();
    let _ = sender.send(ThreadRequest::Generate {
        request: Box::new(request),
        sender: token_sender,
    });

    let mut stdout = std::io::stdout();
    while let Ok(token) = token_receiver.recv_async().await {
        if args.json && matches!(token, Token::Content(_) | Token::Event(_)) {
            continue;
        }
        print(&token, &mut stdout)?;
        if token == Token::Done {
            break;
        }
    }

    drop(sender);
    handle.await?
}

#[tokio::main]
async fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("flm_cli", log::LevelFilter::Info)
        .with_module_level("flm_core", log::LevelFilter::Info)
        .init()
        .expect("start logger");

    let args = Args::parse();
    let cmd = Args::command();
    let version = cmd.get_version().unwrap_or("0.1.0");
    let bin_name = cmd.get_bin_name().unwrap_or("flm");
    log::info!("{}\tversion: {}", bin_name, version);

    if let Err(err) = run(args).await {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
