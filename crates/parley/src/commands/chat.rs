use crate::config::Config;
use anyhow::Result;
use async_trait::async_trait;
use parley_runtime::{
    create_provider, Chat, FallbackHandler, FunctionCall, FunctionResponse, GenerationError, Part,
    SessionStore, TurnEvent,
};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Follow-up rounds answered automatically when the model keeps asking for tools
const MAX_TOOL_ROUNDS: usize = 5;

type SharedInput = Arc<Mutex<Lines<BufReader<Stdin>>>>;

/// Asks on stdin before switching to the fallback model
struct StdinFallback {
    input: SharedInput,
}

#[async_trait]
impl FallbackHandler for StdinFallback {
    async fn accept(&self, current_model: &str, fallback_model: &str) -> anyhow::Result<bool> {
        print!(
            "\n{} is rate limited. Switch to {} for this session? [y/N] ",
            current_model, fallback_model
        );
        std::io::stdout().flush()?;
        let answer = self.input.lock().await.next_line().await?;
        Ok(answer.as_deref().map(is_yes).unwrap_or(false))
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Render one event for the terminal. Content is printed as-is.
fn format_event(event: &TurnEvent) -> String {
    match event {
        TurnEvent::Content(text) => text.clone(),
        TurnEvent::ToolCallRequest(call) => {
            format!("\n[tool call] {}({}) id={}\n", call.name, call.args, call.id)
        }
        TurnEvent::ChatCompressed(info) => format!(
            "\n[history compressed: {} -> {} tokens]\n",
            info.original_token_count, info.new_token_count
        ),
        TurnEvent::ModelFallback { from, to } => {
            format!("\n[switched model: {} -> {}]\n", from, to)
        }
    }
}

async fn print_events(mut rx: mpsc::Receiver<TurnEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        print!("{}", format_event(&event));
        let _ = stdout.flush();
    }
}

/// Error replies for calls this client cannot execute
fn unavailable_tool_responses(calls: &[FunctionCall]) -> Vec<Part> {
    calls
        .iter()
        .map(|call| {
            Part::FunctionResponse(FunctionResponse {
                id: call.id.clone(),
                name: call.name.clone(),
                response: json!({"error": "No tool executor is attached to this client."}),
            })
        })
        .collect()
}

/// Run one user message to completion, cancelling on Ctrl-C
async fn run_turn(chat: &mut Chat, mut parts: Vec<Part>) -> Result<(), GenerationError> {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut result = Ok(());
    for round in 0..=MAX_TOOL_ROUNDS {
        let (tx, rx) = mpsc::channel(64);
        let printer = tokio::spawn(print_events(rx));
        let outcome = chat.send_message(parts, &cancel, &tx).await;
        drop(tx);
        let _ = printer.await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        info!(
            turns = outcome.turns,
            total_tokens = outcome.usage.total_tokens,
            "Message processed"
        );
        if outcome.pending_tool_calls.is_empty() {
            break;
        }
        if round == MAX_TOOL_ROUNDS {
            warn!(rounds = round, "Model kept requesting tools, giving the floor back");
            break;
        }
        parts = unavailable_tool_responses(&outcome.pending_tool_calls);
    }

    interrupt.abort();
    println!();
    result
}

/// Execute chat command
pub async fn execute(session_id: Option<String>, config: &Config) -> Result<()> {
    let provider = create_provider(config.provider.auth_type, config.provider_config()?)?;
    let session_store = SessionStore::new(config.sessions_path())?;

    let input: SharedInput = Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let mut chat = Chat::new(provider, config.session.clone()).with_fallback_handler(Arc::new(
        StdinFallback {
            input: Arc::clone(&input),
        },
    ));

    if let Some(ref sid) = session_id {
        let session = session_store.load(sid).await?;
        chat = chat.with_session(session);
    }

    println!(
        "Parley [{}] - Type 'exit' to quit, '/compress' to summarize history",
        chat.active_model()
    );
    println!("Session: {}", chat.session().id);
    println!("---");

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = async { input.lock().await.next_line().await } => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        if line == "exit" || line == "quit" {
            break;
        }

        if line == "/compress" {
            match chat.try_compress(true, &CancellationToken::new()).await {
                Ok(Some(info)) => print!("{}", format_event(&TurnEvent::ChatCompressed(info))),
                Ok(None) => println!("Nothing to compress."),
                Err(e) => eprintln!("\nError: {}\n", e),
            }
            continue;
        }

        match run_turn(&mut chat, vec![Part::text(line)]).await {
            Ok(()) => {}
            Err(GenerationError::Cancelled) => println!("[cancelled]"),
            Err(e) => eprintln!("\nError: {}\n", e),
        }
    }

    session_store.save(chat.session()).await?;
    println!("\nSession saved: {}", chat.session().id);
    Ok(())
}
