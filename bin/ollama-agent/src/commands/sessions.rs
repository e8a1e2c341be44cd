use chrono::Local;
use ollama_agent_core::{Config, Paths};
use ollama_agent_storage::{SessionStore, SessionSummary};

use super::open_store;

fn store() -> anyhow::Result<SessionStore> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    open_store(&paths, &config)
}

pub(crate) fn print_summaries(sessions: &[SessionSummary], current: Option<&str>) {
    if sessions.is_empty() {
        println!("  (No sessions)");
        return;
    }
    for s in sessions {
        let marker = if current == Some(s.id.as_str()) { "*" } else { " " };
        println!(
            "{} {}  {}  {:>4} msgs  {}",
            marker,
            s.id,
            s.last_active.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            s.message_count,
            s.preview
        );
    }
}

pub async fn list() -> anyhow::Result<()> {
    let sessions = store()?.list()?;
    println!("Sessions ({} total)", sessions.len());
    print_summaries(&sessions, None);
    Ok(())
}

pub async fn delete(session_id: &str) -> anyhow::Result<()> {
    if store()?.delete(session_id)? {
        println!("Deleted session {}", session_id);
    } else {
        println!("No session {}", session_id);
    }
    Ok(())
}
