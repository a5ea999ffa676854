//! Ctrl-C handling
//!
//! Tokio keeps its SIGINT handler installed once `ctrl_c` was first awaited,
//! so a single listener serves the whole session: it stops a streaming answer
//! and otherwise saves and exits.

use parley_core::{ChatEngine, PersistenceGate};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// What a Ctrl-C did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// A streaming answer was stopped
    AbortTurn,
    /// Nothing was running; conversations were saved
    Quit,
}

/// React to one Ctrl-C
pub fn on_interrupt(engine: &ChatEngine, gate: &PersistenceGate) -> Interrupt {
    if engine.is_running() {
        engine.abort();
        return Interrupt::AbortTurn;
    }
    if let Err(e) = gate.save(engine.store()) {
        eprintln!("Warning: Failed to save conversations: {}", e);
    }
    Interrupt::Quit
}

/// Listen for Ctrl-C for the rest of the session
pub fn spawn_interrupt_handler(engine: Arc<ChatEngine>, gate: PersistenceGate) -> JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if on_interrupt(&engine, &gate) == Interrupt::Quit {
                eprintln!();
                // stdin reads block, so the main loop cannot be told to stop
                std::process::exit(130);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_api::{BackendConfig, HttpBackend};
    use parley_core::EngineConfig;
    use std::fs;

    #[test]
    fn test_idle_interrupt_saves_and_quits() {
        let backend = Arc::new(HttpBackend::new(BackendConfig::default()).unwrap());
        let engine = ChatEngine::new(EngineConfig::default(), backend);
        engine.create_conversation(false);
        engine.create_conversation(true);

        let path = std::env::temp_dir()
            .join(format!("parley-cli-{}", uuid::Uuid::new_v4()))
            .join("conversations.json");
        let gate = PersistenceGate::new(path.clone());

        assert!(!engine.is_running());
        assert_eq!(on_interrupt(&engine, &gate), Interrupt::Quit);
        let snapshot = gate.load().unwrap().unwrap();
        assert_eq!(snapshot.conversations.len(), 1);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
