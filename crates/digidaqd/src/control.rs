//! Operator commands read from stdin.
//!
//! A reader thread turns input lines into [`Command`]s and forwards them
//! through a channel, so the acquisition loop only ever polls.

use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Stop acquisition and exit.
    Quit,
    /// Re-read the source configs and apply them.
    Reload,
}

/// Maps one input line to a command. Unknown input is ignored.
pub fn parse_command(line: &str) -> Option<Command> {
    match line.trim().chars().next()? {
        'q' | 'Q' => Some(Command::Quit),
        'r' | 'R' => Some(Command::Reload),
        _ => None,
    }
}

pub struct CommandReader {
    rx: Receiver<Command>,
}

impl CommandReader {
    /// Spawns the stdin reader thread.
    ///
    /// When stdin reaches EOF the thread ends quietly; the daemon keeps
    /// running until Ctrl-C.
    pub fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("stdin-commands".to_string())
            .spawn(move || {
                let stdin = io::stdin();
                for line in stdin.lock().lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "stdin read failed, keyboard control disabled");
                            break;
                        }
                    };
                    match parse_command(&line) {
                        Some(cmd) => {
                            if tx.send(cmd).is_err() {
                                break;
                            }
                        }
                        None if !line.trim().is_empty() => {
                            eprintln!("unknown command '{}' (q: quit, r: reload)", line.trim());
                        }
                        None => {}
                    }
                }
                debug!("stdin closed");
            })?;
        Ok(Self { rx })
    }

    /// Returns the next pending command without blocking.
    pub fn try_next(&self) -> Option<Command> {
        match self.rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("q"), Some(Command::Quit));
        assert_eq!(parse_command("  Quit\n"), Some(Command::Quit));
        assert_eq!(parse_command("r"), Some(Command::Reload));
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("x"), None);
    }
}
