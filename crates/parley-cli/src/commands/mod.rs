//! Slash commands for interactive mode

/// Result of parsing a slash command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Start a new conversation; ephemeral ones are never saved
    New { ephemeral: bool },
    /// Print the conversation list
    List,
    /// Switch to the conversation at this list position (0-based)
    Open(usize),
    /// Delete the conversation at this list position (0-based)
    Delete(usize),
    /// Register the current conversation with the backend
    Publish,
    /// Show a message to the user (not sent to the backend)
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse a slash command. Returns `None` for regular chat input.
pub fn execute_command(input: &str) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let parts: Vec<&str> = rest.splitn(2, ' ').collect();
    let command = parts[0].to_lowercase();
    let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),

        "new" | "n" => CommandResult::New { ephemeral: false },

        "temp" | "t" => CommandResult::New { ephemeral: true },

        "list" | "l" | "ls" => CommandResult::List,

        "open" | "o" => match parse_position(args) {
            Ok(idx) => CommandResult::Open(idx),
            Err(msg) => CommandResult::Message(msg),
        },

        "delete" | "d" | "rm" => match parse_position(args) {
            Ok(idx) => CommandResult::Delete(idx),
            Err(msg) => CommandResult::Message(msg),
        },

        "publish" | "p" => CommandResult::Publish,

        "quit" | "exit" | "q" => CommandResult::Exit,

        _ => CommandResult::Unknown(command),
    })
}

/// Parse a 1-based list position as shown by `/list`
fn parse_position(args: &str) -> Result<usize, String> {
    match args.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n - 1),
        _ => Err(format!(
            "Expected a conversation number from /list, got {:?}",
            args
        )),
    }
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?        Show this help message
  /new, /n             Start a new conversation
  /temp, /t            Start a temporary conversation (never saved)
  /list, /l            List conversations
  /open, /o <n>        Switch to conversation n
  /delete, /d <n>      Delete conversation n
  /publish, /p         Register the current conversation with the backend
  /quit, /exit, /q     Exit parley

Press Ctrl-C while an answer streams to stop it.
At the prompt, Ctrl-C saves and exits."#
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_input_is_not_a_command() {
        assert_eq!(execute_command("hello there"), None);
        assert_eq!(execute_command("  what is 2/3?"), None);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            execute_command("/new"),
            Some(CommandResult::New { ephemeral: false })
        );
        assert_eq!(
            execute_command("/TEMP"),
            Some(CommandResult::New { ephemeral: true })
        );
        assert_eq!(execute_command("/open 2"), Some(CommandResult::Open(1)));
        assert_eq!(execute_command("/d 1"), Some(CommandResult::Delete(0)));
        assert_eq!(execute_command("/q"), Some(CommandResult::Exit));
        assert_eq!(
            execute_command("/frobnicate"),
            Some(CommandResult::Unknown("frobnicate".into()))
        );
    }

    #[test]
    fn test_bad_positions() {
        assert!(matches!(
            execute_command("/open"),
            Some(CommandResult::Message(_))
        ));
        assert!(matches!(
            execute_command("/delete 0"),
            Some(CommandResult::Message(_))
        ));
        assert!(matches!(
            execute_command("/open two"),
            Some(CommandResult::Message(_))
        ));
    }
}
