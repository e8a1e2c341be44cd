use futures::StreamExt;
use ollama_agent_core::{Config, Paths, StreamEvent, ToolResult, ToolStatus};
use ollama_agent_runtime::{RuntimeDispatcher, TurnOverrides};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use super::build_dispatcher;
use super::sessions::print_summaries;

/// Command-line overrides applied to every turn of this run.
#[derive(Debug, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub effort: Option<String>,
    pub timeout: Option<u64>,
    pub session: Option<String>,
}

impl ChatOptions {
    fn overrides(&self) -> TurnOverrides {
        let mut overrides = TurnOverrides::default();
        if let Some(model) = &self.model {
            overrides = overrides.model(model.clone());
        }
        if let Some(effort) = &self.effort {
            overrides = overrides.reasoning_effort(effort.clone());
        }
        overrides
    }

    /// Settings that are fixed for the whole process, applied before the
    /// dispatcher is built.
    fn apply_to_config(&self, config: &mut Config) {
        if let Some(secs) = self.timeout {
            config.builtin_tool_timeout = secs;
        }
    }
}

/// How a rendered turn ended.
#[derive(Debug, PartialEq, Eq)]
enum TurnEnd {
    Completed,
    Failed,
    Interrupted,
}

pub async fn run(prompt: Option<String>, options: ChatOptions) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(&Paths::new())?;
    options.apply_to_config(&mut config);
    let dispatcher = build_dispatcher(config)?;

    let outcome = match prompt {
        Some(prompt) => one_shot(&dispatcher, &prompt, &options).await,
        None => interactive(&dispatcher, &options).await,
    };

    let report = dispatcher.shutdown().await;
    for (name, error) in &report.failures {
        eprintln!("Warning: provider {} did not shut down cleanly: {}", name, error);
    }
    debug!(stopped = report.stopped, "Providers cleaned up");
    outcome
}

fn open_session(dispatcher: &RuntimeDispatcher, requested: Option<&str>) -> anyhow::Result<String> {
    match requested {
        Some(id) => Ok(id.to_string()),
        None => Ok(dispatcher.store().reset()?),
    }
}

async fn one_shot(dispatcher: &RuntimeDispatcher, prompt: &str, options: &ChatOptions) -> anyhow::Result<()> {
    let session = open_session(dispatcher, options.session.as_deref())?;
    match render_turn(dispatcher, &session, prompt, options.overrides()).await {
        TurnEnd::Completed => Ok(()),
        TurnEnd::Failed => anyhow::bail!("turn failed"),
        TurnEnd::Interrupted => anyhow::bail!("interrupted"),
    }
}

async fn interactive(dispatcher: &RuntimeDispatcher, options: &ChatOptions) -> anyhow::Result<()> {
    let mut session = open_session(dispatcher, options.session.as_deref())?;
    let overrides = options.overrides();

    println!("ollama-agent interactive mode (/exit to quit)");
    println!("Session: {}", session);
    println!("Commands: /new new session | /sessions list | /load <id> | /delete <id> | /exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(raw) = lines.next_line().await? else {
            println!();
            break;
        };
        let input = raw.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = input.strip_prefix('/') {
            let (name, arg) = match command.split_once(char::is_whitespace) {
                Some((name, arg)) => (name, arg.trim()),
                None => (command, ""),
            };
            match name {
                "exit" | "quit" => break,
                "new" => {
                    session = dispatcher.store().reset()?;
                    println!("Started session {}", session);
                }
                "sessions" => match dispatcher.store().list() {
                    Ok(list) => print_summaries(&list, Some(session.as_str())),
                    Err(e) => eprintln!("Error: {}", e),
                },
                "load" if !arg.is_empty() => match dispatcher.store().exists(arg) {
                    Ok(true) => {
                        session = arg.to_string();
                        let count = dispatcher.store().load(&session).map(|h| h.len()).unwrap_or(0);
                        println!("Loaded session {} ({} messages)", session, count);
                    }
                    Ok(false) => println!("No session {}", arg),
                    Err(e) => eprintln!("Error: {}", e),
                },
                "delete" if !arg.is_empty() => match dispatcher.store().delete(arg) {
                    Ok(true) => {
                        println!("Deleted session {}", arg);
                        if arg == session {
                            session = dispatcher.store().reset()?;
                            println!("Started session {}", session);
                        }
                    }
                    Ok(false) => println!("No session {}", arg),
                    Err(e) => eprintln!("Error: {}", e),
                },
                "load" | "delete" => println!("  Usage: /{} <session id>", name),
                _ => println!("  Unknown command: /{}", name),
            }
            continue;
        }

        if render_turn(dispatcher, &session, input, overrides.clone()).await == TurnEnd::Interrupted {
            println!("(turn cancelled)");
        }
    }
    Ok(())
}

/// Stream one turn to the terminal. Ctrl+C drops the stream, which cancels
/// the turn and kills any running tool process.
async fn render_turn(
    dispatcher: &RuntimeDispatcher,
    session: &str,
    text: &str,
    overrides: TurnOverrides,
) -> TurnEnd {
    let mut events = dispatcher.run_streamed(session, text, overrides);
    let mut renderer = Renderer::default();
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    if !renderer.render(&event) {
                        return TurnEnd::Failed;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                renderer.finish_line();
                return TurnEnd::Interrupted;
            }
        }
    }
    renderer.finish_line();
    TurnEnd::Completed
}

#[derive(Default)]
struct Renderer {
    in_reasoning: bool,
    line_open: bool,
}

impl Renderer {
    /// Print one event. Returns false on a terminal error event.
    fn render(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::ReasoningDelta(delta) => {
                if !self.in_reasoning {
                    self.finish_line();
                    eprint!("[thinking] ");
                    self.in_reasoning = true;
                }
                eprint!("{}", delta);
                let _ = std::io::stderr().flush();
            }
            StreamEvent::ReasoningSummary(summary) => {
                self.end_reasoning();
                eprintln!("[summary] {}", summary);
            }
            StreamEvent::TextDelta(delta) => {
                self.end_reasoning();
                print!("{}", delta);
                let _ = std::io::stdout().flush();
                self.line_open = !delta.ends_with('\n');
            }
            StreamEvent::ToolCall { name, arguments, .. } => {
                self.end_reasoning();
                self.finish_line();
                eprintln!("-> {} {}", name, arguments);
            }
            StreamEvent::ToolOutput { name, result, .. } => {
                eprintln!("<- {} {}", name, describe(result));
            }
            StreamEvent::AgentUpdate { name, detail } => {
                debug!(agent = %name, "{}", detail);
                if detail.starts_with("provider unavailable") {
                    warn!(agent = %name, "{}", detail);
                }
            }
            StreamEvent::Error { kind, message } => {
                self.end_reasoning();
                self.finish_line();
                eprintln!("Error ({}): {}", kind, message);
                return false;
            }
        }
        true
    }

    fn end_reasoning(&mut self) {
        if self.in_reasoning {
            eprintln!();
            self.in_reasoning = false;
        }
    }

    fn finish_line(&mut self) {
        self.end_reasoning();
        if self.line_open {
            println!();
            self.line_open = false;
        }
    }
}

fn describe(result: &ToolResult) -> String {
    let status = match result.status {
        ToolStatus::Ok => "ok",
        ToolStatus::Timeout => "timeout",
        ToolStatus::Error => "error",
    };
    let mut out = format!("[{}, {:.1}s]", status, result.elapsed_seconds);
    if let Some(code) = result.exit_code {
        out.push_str(&format!(" exit {}", code));
    }
    let detail = if result.is_ok() { &result.stdout } else { &result.stderr };
    if let Some(first) = detail.lines().find(|l| !l.trim().is_empty()) {
        let first: String = first.chars().take(120).collect();
        out.push_str(&format!(" {}", first));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_from_options() {
        let options = ChatOptions {
            model: Some("qwen3:8b".to_string()),
            effort: Some("high".to_string()),
            timeout: Some(5),
            session: None,
        };
        let overrides = options.overrides();
        assert_eq!(overrides.model.as_deref(), Some("qwen3:8b"));
        assert_eq!(overrides.reasoning_effort.as_deref(), Some("high"));
        assert!(overrides.tool_timeout.is_none());
        assert!(overrides.capabilities.is_none());

        let empty = ChatOptions::default().overrides();
        assert!(empty.model.is_none() && empty.tool_timeout.is_none());
    }

    #[test]
    fn test_timeout_flag_sets_builtin_default() {
        let mut config = Config::default();
        ChatOptions::default().apply_to_config(&mut config);
        assert_eq!(config.builtin_tool_timeout, 30);

        let options = ChatOptions {
            timeout: Some(5),
            ..Default::default()
        };
        options.apply_to_config(&mut config);
        assert_eq!(config.builtin_tool_timeout, 5);
    }

    #[test]
    fn test_renderer_stops_on_error() {
        let mut renderer = Renderer::default();
        assert!(renderer.render(&StreamEvent::TextDelta("hi".into())));
        assert!(renderer.line_open);
        assert!(!renderer.render(&StreamEvent::Error {
            kind: "model_stream_error".into(),
            message: "reset".into(),
        }));
        assert!(!renderer.line_open);
    }

    #[test]
    fn test_describe_tool_result() {
        let mut ok = ToolResult::ok("\nfile.txt\nother").with_elapsed(0.5);
        ok.exit_code = Some(0);
        assert_eq!(describe(&ok), "[ok, 0.5s] exit 0 file.txt");
        assert_eq!(describe(&ToolResult::error("boom")), "[error, 0.0s] boom");
    }
}
