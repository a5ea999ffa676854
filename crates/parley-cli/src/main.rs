//! parley - terminal client for a synced chat backend

mod commands;
mod config;
mod interrupt;
mod printer;
mod utils;

use clap::Parser;
use commands::CommandResult;
use parley_api::{HttpBackend, Role};
use parley_core::{ChatEngine, Conversation, EngineEvent, PersistenceGate, TurnOutcome};
use printer::StreamPrinter;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// parley - chat with a conversation backend from the terminal
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend base URL (default: http://127.0.0.1:8000/api)
    #[arg(long)]
    base_url: Option<String>,

    /// Send a single message in a new conversation and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Start in a temporary conversation that is never saved
    #[arg(long)]
    ephemeral: bool,

    /// List conversations and exit
    #[arg(long)]
    list: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Skip fetching conversations from the backend at startup
    #[arg(long)]
    no_sync: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("parley=debug,parley_api=debug,parley_core=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    // stdout carries the conversation
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

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

    // CLI takes precedence over the config file
    let mut backend_config = cfg.backend();
    if let Some(url) = args.base_url {
        backend_config.base_url = url;
    }
    let backend = Arc::new(HttpBackend::new(backend_config)?);
    let engine = Arc::new(ChatEngine::new(cfg.engine(), backend));

    let gate = PersistenceGate::new(cfg.snapshot_path());
    let restored = gate.restore_into(engine.store());
    tracing::debug!("Restored {} conversations", restored);

    if !args.no_sync {
        // a failed sync is logged by the reconciler; keep working offline
        let _ = engine.start().await;
    }

    if args.list {
        print_conversations(&engine);
        return Ok(());
    }

    let autosave = parley_core::spawn_autosave(engine.store(), gate.clone(), cfg.autosave_debounce());
    let interrupts = interrupt::spawn_interrupt_handler(engine.clone(), gate.clone());

    let result = if let Some(command) = args.command {
        engine.create_conversation(args.ephemeral);
        send_and_print(&engine, &command).await
    } else {
        if args.ephemeral {
            engine.create_conversation(true);
        }
        run_interactive(&engine).await
    };

    interrupts.abort();
    autosave.abort();
    if let Err(e) = gate.save(engine.store()) {
        eprintln!("Warning: Failed to save conversations: {}", e);
    }
    result
}

/// Send one message and print the answer as it streams
async fn send_and_print(engine: &Arc<ChatEngine>, text: &str) -> anyhow::Result<()> {
    let mut current = engine.subscribe_current();
    let mut events = engine.subscribe_events();
    let mut printer = StreamPrinter::new(current.borrow_and_update().as_ref());

    let turn = engine.send_turn(text);
    tokio::pin!(turn);

    let outcome = loop {
        tokio::select! {
            outcome = &mut turn => break outcome,
            changed = current.changed() => {
                if changed.is_ok() {
                    let conversation = current.borrow_and_update().clone();
                    printer.update(conversation.as_ref());
                }
            }
            event = events.recv() => match event {
                Ok(EngineEvent::Status { content }) => eprintln!("[{}]", content),
                Ok(EngineEvent::ToolResult { tool_name, content }) => eprintln!(
                    "[{}: {}]",
                    tool_name.as_deref().unwrap_or("tool"),
                    utils::truncate_chars(&content, 200)
                ),
                _ => {}
            },
        }
    };
    printer.update(engine.store().current().as_ref());
    println!();

    match outcome {
        Ok(TurnOutcome::Completed) => {
            if let Some(usage) = engine
                .store()
                .current()
                .and_then(|c| c.messages.last().and_then(|m| m.usage.clone()))
            {
                let cost = usage
                    .cost_eur
                    .map(|c| format!(" | Cost: €{:.4}", c))
                    .unwrap_or_default();
                eprintln!(
                    "[Tokens: {} in, {} out{}]",
                    usage.input_tokens, usage.output_tokens, cost
                );
            }
        }
        Ok(TurnOutcome::Cancelled) => eprintln!("[Cancelled]"),
        // the error text is already the message body
        Ok(TurnOutcome::Failed(_)) => {}
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(())
}

async fn run_interactive(engine: &Arc<ChatEngine>) -> anyhow::Result<()> {
    use std::io::{self, Write};

    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!("parley ({} conversations)", engine.store().len());
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

        if let Some(result) = commands::execute_command(input) {
            match result {
                CommandResult::New { ephemeral } => {
                    engine.create_conversation(ephemeral);
                    if ephemeral {
                        println!("Started a temporary conversation (not saved).");
                    } else {
                        println!("Started a new conversation.");
                    }
                }
                CommandResult::List => print_conversations(engine),
                CommandResult::Open(idx) => match nth_conversation(engine, idx) {
                    Some(id) => {
                        engine.select_conversation(&id).await?;
                        if let Some(conversation) = engine.store().current() {
                            print_history(&conversation);
                        }
                    }
                    None => println!("No conversation {}. See /list.", idx + 1),
                },
                CommandResult::Delete(idx) => match nth_conversation(engine, idx) {
                    Some(id) => {
                        engine.delete_conversation(&id).await?;
                        println!("Deleted conversation {}.", idx + 1);
                    }
                    None => println!("No conversation {}. See /list.", idx + 1),
                },
                CommandResult::Publish => match engine.store().current_id() {
                    Some(id) => match engine.publish_conversation(&id).await {
                        Ok(new_id) => println!("Published as {}.", new_id),
                        Err(e) => println!("Could not publish: {}", e),
                    },
                    None => println!("No current conversation."),
                },
                CommandResult::Message(msg) => println!("{}", msg),
                CommandResult::Exit => break,
                CommandResult::Unknown(cmd) => {
                    println!(
                        "Unknown command: /{}. Type /help for available commands.",
                        cmd
                    );
                }
            }
            continue;
        }

        send_and_print(engine, input).await?;
        println!();
    }

    Ok(())
}

fn nth_conversation(engine: &ChatEngine, idx: usize) -> Option<String> {
    engine.store().conversations().get(idx).map(|c| c.id.clone())
}

fn print_conversations(engine: &ChatEngine) {
    let conversations = engine.store().conversations();
    if conversations.is_empty() {
        println!("No conversations yet.");
        return;
    }
    let current = engine.store().current_id();

    println!("{:<4} {:<54} {:<6} {:<17} Flags", "#", "Title", "Msgs", "Updated");
    println!("{}", "-".repeat(90));
    for (idx, c) in conversations.iter().enumerate() {
        let marker = if current.as_deref() == Some(c.id.as_str()) {
            "*"
        } else {
            " "
        };
        let mut flags = Vec::new();
        if !c.synced {
            flags.push("local");
        }
        if c.ephemeral {
            flags.push("temp");
        }
        if c.is_streaming {
            flags.push("streaming");
        }
        println!(
            "{}{:<3} {:<54} {:<6} {:<17} {}",
            marker,
            idx + 1,
            utils::truncate_chars(&c.title, 50),
            c.message_count,
            utils::format_timestamp(c.updated_at),
            flags.join(",")
        );
    }
}

fn print_history(conversation: &Conversation) {
    println!("== {} ==", conversation.title);
    for message in &conversation.messages {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        println!("{}: {}", who, message.content);
    }
}
