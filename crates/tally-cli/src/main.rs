//! tally - terminal client for the chat dashboard

mod commands;
mod config;
mod input;
mod render;
mod utils;

use std::io::{self, IsTerminal, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use crossterm::event::{Event, EventStream};
use crossterm::terminal;
use futures::{FutureExt, StreamExt};
use tally_ai::{HttpBackend, TraceSource};
use tally_chat::{
    ChatHandle, ReplayOutcome, ReplayScheduler, TranscriptEvent, TransmissionController,
    load_conversation, reconstruct,
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing_subscriber::EnvFilter;

use crate::commands::CommandResult;
use crate::input::{KeyMap, ReplayAction};
use crate::render::Printer;

/// tally - chat with a dashboard agent, browse and replay past conversations
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend URL (default: from config, else http://localhost:8000)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Agent configuration id to chat with
    #[arg(short, long, global = true)]
    agent: Option<i64>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat interactively (the default)
    Chat {
        /// Send a single message and exit
        #[arg(short = 'c', long)]
        message: Option<String>,
    },
    /// Print a past conversation
    History { conversation: String },
    /// Replay a past conversation at typing speed
    Replay {
        conversation: String,
        /// Type user turns without waiting for the step key
        #[arg(long)]
        auto: bool,
        /// Seed for reproducible pacing
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(args.verbose))
        .with_writer(io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();
    let base_url = cfg.base_url(args.base_url.as_deref());
    let agent_id = args.agent.or(cfg.agent_id);
    let backend = Arc::new(HttpBackend::new(base_url)?);

    match args.command.unwrap_or(Command::Chat { message: None }) {
        Command::Chat {
            message: Some(text),
        } => run_command(backend, agent_id, &text).await,
        Command::Chat { message: None } => run_interactive(backend, agent_id).await,
        Command::History { conversation } => show_history(backend.as_ref(), &conversation).await,
        Command::Replay {
            conversation,
            auto,
            seed,
        } => run_replay(backend.as_ref(), &cfg, &conversation, auto, seed).await,
    }
}

/// `tally=debug` under `--verbose`, otherwise whatever `RUST_LOG` asks for
fn log_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("tally=debug")
    } else {
        EnvFilter::from_default_env()
    }
}

type Events = BroadcastStream<TranscriptEvent>;

fn print_event(
    event: Result<TranscriptEvent, BroadcastStreamRecvError>,
    printer: &mut Printer,
    out: &mut impl Write,
) -> io::Result<()> {
    match event {
        Ok(event) => printer.handle(&event, out),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "transcript printer fell behind");
            Ok(())
        }
    }
}

/// Print whatever is already queued
fn drain(events: &mut Events, printer: &mut Printer, out: &mut impl Write) -> io::Result<()> {
    while let Some(Some(event)) = events.next().now_or_never() {
        print_event(event, printer, out)?;
    }
    Ok(())
}

/// Run `task` while printing transcript events as they arrive
async fn with_output<F: std::future::Future>(
    task: F,
    events: &mut Events,
    printer: &mut Printer,
) -> io::Result<F::Output> {
    tokio::pin!(task);
    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            output = &mut task => {
                drain(events, printer, &mut stdout)?;
                return Ok(output);
            }
            Some(event) = events.next() => print_event(event, printer, &mut stdout)?,
        }
    }
}

async fn run_command(
    backend: Arc<HttpBackend>,
    agent_id: Option<i64>,
    text: &str,
) -> anyhow::Result<()> {
    let handle = ChatHandle::new();
    let mut events = BroadcastStream::new(handle.subscribe());
    let controller = TransmissionController::new(backend, handle).with_agent(agent_id);
    let mut printer = Printer::new();

    let message = with_output(controller.send(text), &mut events, &mut printer).await??;
    if let Some(error) = message.error {
        anyhow::bail!(error);
    }
    Ok(())
}

async fn run_interactive(backend: Arc<HttpBackend>, agent_id: Option<i64>) -> anyhow::Result<()> {
    let handle = ChatHandle::new();
    let mut events = BroadcastStream::new(handle.subscribe());
    let controller =
        TransmissionController::new(backend.clone(), handle.clone()).with_agent(agent_id);
    let mut printer = Printer::new();

    // Show minimal startup info (only if TTY)
    if io::stderr().is_terminal() {
        eprintln!("tally ({}) conversation: {}", backend.base_url(), handle.session_id());
        eprintln!("Type /help for commands.");
        eprintln!();
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = commands::parse_command(input) {
            match command {
                CommandResult::NewChat => match handle.new_chat() {
                    Ok(id) => println!("New chat: {}", id),
                    Err(e) => eprintln!("Error: {}", e),
                },
                CommandResult::Load(id) => {
                    let loaded = with_output(
                        load_conversation(backend.as_ref(), &handle, &id),
                        &mut events,
                        &mut printer,
                    )
                    .await?;
                    match loaded {
                        Ok(_) => {
                            let mut stdout = io::stdout();
                            for message in handle.messages() {
                                printer.print_message(&message, &mut stdout)?;
                            }
                            println!("(read-only; /new to start chatting again)");
                        }
                        Err(e) => eprintln!("Error loading conversation: {}", e),
                    }
                }
                CommandResult::Session => {
                    let read_only = handle.with_store(|store| store.is_read_only());
                    println!(
                        "Conversation: {}{}",
                        handle.session_id(),
                        if read_only { " (read-only)" } else { "" }
                    );
                }
                CommandResult::Message(msg) => println!("{}", msg),
                CommandResult::Exit => break,
                CommandResult::Unknown(cmd) => {
                    println!("Unknown command: /{}", cmd);
                    println!("Type /help for available commands.");
                }
            }
            continue;
        }

        if let Err(e) = with_output(controller.send(input), &mut events, &mut printer).await? {
            eprintln!("Error: {}", e);
        }
    }

    Ok(())
}

async fn show_history(source: &dyn TraceSource, conversation: &str) -> anyhow::Result<()> {
    let handle = ChatHandle::new();
    let count = load_conversation(source, &handle, conversation).await?;
    if count == 0 {
        println!("No messages in conversation {}", conversation);
        return Ok(());
    }

    let mut printer = Printer::new();
    let mut stdout = io::stdout();
    for message in handle.messages() {
        printer.print_message(&message, &mut stdout)?;
    }
    Ok(())
}

/// Restores cooked mode when dropped
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

async fn run_replay(
    source: &dyn TraceSource,
    cfg: &config::Config,
    conversation: &str,
    auto: bool,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let keys = KeyMap::from_config(&cfg.replay.keys)?;
    let traces = source.conversation_traces(conversation).await?;
    let messages = reconstruct(&traces);
    if messages.is_empty() {
        println!("No messages in conversation {}", conversation);
        return Ok(());
    }

    let handle = ChatHandle::new();
    let mut events = BroadcastStream::new(handle.subscribe());
    let mut scheduler = ReplayScheduler::new(handle)
        .with_pacing(cfg.replay.pacing.clone())
        .with_auto_step(auto || cfg.replay.auto_step.unwrap_or(false));
    if let Some(seed) = seed {
        scheduler = scheduler.with_seed(seed);
    }

    eprintln!(
        "Replaying {} messages ({}: next turn, {}: pause, {}: stop)",
        messages.len(),
        cfg.replay.keys.step,
        cfg.replay.keys.pause,
        cfg.replay.keys.stop
    );

    let raw_mode = RawMode::enable()?;
    let mut printer = Printer::raw();
    let mut stdout = io::stdout();
    let mut keyboard = EventStream::new();

    let Some(mut task) = scheduler.start(messages) else {
        anyhow::bail!("conversation is busy");
    };

    let outcome = loop {
        tokio::select! {
            outcome = &mut task => {
                drain(&mut events, &mut printer, &mut stdout)?;
                break outcome?;
            }
            Some(event) = events.next() => print_event(event, &mut printer, &mut stdout)?,
            Some(Ok(Event::Key(key))) = keyboard.next() => match keys.action(key) {
                ReplayAction::Step => scheduler.step(),
                ReplayAction::TogglePause => {
                    let paused = scheduler.toggle_pause();
                    tracing::debug!(paused, "replay pause toggled");
                }
                ReplayAction::Stop | ReplayAction::Interrupt => scheduler.stop(),
                ReplayAction::Ignore => {}
            },
        }
    };
    drop(raw_mode);

    if outcome == ReplayOutcome::Cancelled {
        println!();
        println!("Replay stopped.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_enables_debug_logging() {
        assert_eq!(log_filter(true).to_string(), "tally=debug");
    }

    #[test]
    fn test_subcommands_parse() {
        let args =
            Args::try_parse_from(["tally", "replay", "conv-1", "--auto", "--seed", "3"]).unwrap();
        let Some(Command::Replay {
            conversation,
            auto,
            seed,
        }) = args.command
        else {
            panic!("expected replay");
        };
        assert_eq!((conversation.as_str(), auto, seed), ("conv-1", true, Some(3)));
        let args = Args::try_parse_from(["tally", "-v", "chat", "-c", "hi"]).unwrap();
        assert!(args.verbose);
    }
}
