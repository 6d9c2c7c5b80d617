//! Line parsing for the interactive client shell.
//!
//! [`ConsoleCommand`] is what a user types. Only PUT and DELETE go through
//! agreement; GET is a direct read and the rest are shell meta-commands.

use anyhow::{Result, anyhow};

pub const USAGE: &str =
    "PUT/p <key> <value>, GET/g <key>, DELETE/d <key>, STATUS/s, HELP/h, EXIT/e";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Status,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses one line of input. Verbs are case-insensitive and accept their
    /// first letter as an alias; keys and values are single words.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let verb = first.to_uppercase();
        let verb = match verb.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "D" => "DELETE",
            "S" => "STATUS",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (verb, parts.len()) {
            ("EXIT", _) => Ok(ConsoleCommand::Exit),
            ("HELP", _) => Ok(ConsoleCommand::Help),
            ("STATUS", _) => Ok(ConsoleCommand::Status),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
            }),
            ("DELETE", 2) => Ok(ConsoleCommand::Delete {
                key: parts[1].to_string(),
            }),
            ("PUT", 3) => Ok(ConsoleCommand::Put {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("DELETE", _) => Err(anyhow!("DELETE requires exactly one argument: DELETE <key>")),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            _ => Err(anyhow!("invalid command. Try: {USAGE}")),
        }
    }
}
