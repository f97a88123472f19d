use std::path::PathBuf;

use nearchat_engine::service::ServiceCmd;

/// What the prompt loop should do with one line of input.
#[derive(Debug)]
pub enum Action {
    /// Forward a command to the service.
    Send(ServiceCmd),
    /// Print the help text.
    Help,
    /// Exit the prompt loop.
    Quit,
    /// Print a usage message.
    Invalid(String),
}

/// Parses one trimmed input line into an [`Action`].
///
/// `default_listen` is the address used by a bare `listen` command.
pub fn parse_line(line: &str, default_listen: &str) -> Action {
    let (verb, rest) = match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb {
        "listen" => {
            let addr = if rest.is_empty() {
                default_listen.to_string()
            } else {
                rest.to_string()
            };
            Action::Send(ServiceCmd::StartServer { addr })
        }
        "connect" => {
            if rest.is_empty() {
                Action::Invalid("Usage: connect <addr>   e.g. connect 192.168.1.42:4760".into())
            } else {
                Action::Send(ServiceCmd::Connect {
                    addr: rest.to_string(),
                })
            }
        }
        "say" => {
            if rest.is_empty() {
                Action::Invalid("Usage: say <message>".into())
            } else {
                Action::Send(ServiceCmd::SendMessage {
                    text: rest.to_string(),
                })
            }
        }
        "send" => {
            if rest.is_empty() {
                return Action::Invalid("Usage: send <file_path>".into());
            }
            let path = PathBuf::from(rest);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => Action::Send(ServiceCmd::SendFile { path }),
                Ok(_) => Action::Invalid(format!("{} is not a regular file", path.display())),
                Err(e) => Action::Invalid(format!("Cannot read {}: {e}", path.display())),
            }
        }
        "accept" => Action::Send(ServiceCmd::AcceptVerification),
        "reject" => Action::Send(ServiceCmd::RejectVerification),
        "stop" => Action::Send(ServiceCmd::Stop),
        "clear" => Action::Send(ServiceCmd::ClearError),
        "help" | "?" => Action::Help,
        "quit" | "exit" | "q" => Action::Quit,
        other => Action::Invalid(format!(
            "Unknown command: \"{other}\".  Type 'help' for usage."
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Given a bare listen command, when parsed, then the default address
    /// is used.
    #[test]
    fn given_bare_listen_when_parsed_then_uses_default_address() {
        let action = parse_line("listen", "0.0.0.0:4760");
        match action {
            Action::Send(ServiceCmd::StartServer { addr }) => assert_eq!(addr, "0.0.0.0:4760"),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    /// Given a connect command with an address, when parsed, then the
    /// address is forwarded.
    #[test]
    fn given_connect_with_addr_when_parsed_then_forwards_addr() {
        let action = parse_line("connect 10.0.0.5:4760", "0.0.0.0:4760");
        match action {
            Action::Send(ServiceCmd::Connect { addr }) => assert_eq!(addr, "10.0.0.5:4760"),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    /// Given a connect command without an address, when parsed, then a
    /// usage message is returned.
    #[test]
    fn given_connect_without_addr_when_parsed_then_invalid() {
        assert!(matches!(
            parse_line("connect", "0.0.0.0:4760"),
            Action::Invalid(_)
        ));
    }

    /// Given a say command, when parsed, then the whole remainder becomes
    /// the message including spaces.
    #[test]
    fn given_say_with_spaces_when_parsed_then_text_preserved() {
        let action = parse_line("say hello there peer", "0.0.0.0:4760");
        match action {
            Action::Send(ServiceCmd::SendMessage { text }) => {
                assert_eq!(text, "hello there peer");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    /// Given a send command pointing at a missing file, when parsed, then
    /// a usage message is returned instead of a command.
    #[test]
    fn given_send_with_missing_file_when_parsed_then_invalid() {
        assert!(matches!(
            parse_line("send /no/such/file.bin", "0.0.0.0:4760"),
            Action::Invalid(_)
        ));
    }

    /// Given quit aliases, when parsed, then all map to Quit.
    #[test]
    fn given_quit_aliases_when_parsed_then_all_quit() {
        for line in ["quit", "exit", "q"] {
            assert!(matches!(parse_line(line, "0.0.0.0:4760"), Action::Quit));
        }
    }

    /// Given an unknown verb, when parsed, then an invalid action names it.
    #[test]
    fn given_unknown_verb_when_parsed_then_invalid_names_it() {
        match parse_line("teleport home", "0.0.0.0:4760") {
            Action::Invalid(message) => assert!(message.contains("teleport")),
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
