//! Commands carried inside a proposal.
//!
//! A command travels between the coordinator and the replicas as a delimited
//! triple `key value operation`, e.g. `1000 -20 put` or `1000 null delete`.
//! DELETE has no value; the placeholder `null` fills its slot on the wire.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const EMPTY_VALUE: &str = "null";

/// Mutating operations that go through agreement. GET is a direct read and
/// never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Put,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Put => "put",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A PUT or DELETE against a single key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    pub key: String,
    pub value: Option<String>,
    pub operation: Operation,
}

impl Command {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            operation: Operation::Put,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            operation: Operation::Delete,
        }
    }

    /// Encodes the command as its wire triple.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decodes a wire triple.
    pub fn decode(raw: &str) -> Result<Self, MalformedCommand> {
        raw.parse()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value.as_deref().unwrap_or(EMPTY_VALUE);
        write!(f, "{} {} {}", self.key, value, self.operation)
    }
}

/// Reasons a wire triple could not be turned into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedCommand {
    #[error("expected 'key value operation', got {0} part(s)")]
    Arity(usize),
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
}

impl FromStr for Command {
    type Err = MalformedCommand;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        let [key, value, operation] = parts[..] else {
            return Err(MalformedCommand::Arity(parts.len()));
        };

        match operation.to_ascii_lowercase().as_str() {
            "put" => Ok(Command::put(key, value)),
            "delete" => Ok(Command::delete(key)),
            other => Err(MalformedCommand::UnknownOperation(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_delete_with_placeholder_value() {
        assert_eq!(Command::put("1000", "-20").encode(), "1000 -20 put");
        assert_eq!(Command::delete("1000").encode(), "1000 null delete");
    }

    #[test]
    fn decodes_case_insensitive_operation() {
        assert_eq!(Command::decode("k v PUT"), Ok(Command::put("k", "v")));
        assert_eq!(Command::decode("k null Delete"), Ok(Command::delete("k")));
    }

    #[test]
    fn rejects_wrong_arity() {
        assert_eq!(Command::decode("k put"), Err(MalformedCommand::Arity(2)));
        assert_eq!(Command::decode(""), Err(MalformedCommand::Arity(0)));
        assert_eq!(
            Command::decode("k v put extra"),
            Err(MalformedCommand::Arity(4))
        );
    }

    #[test]
    fn rejects_unknown_operation() {
        assert_eq!(
            Command::decode("k v get"),
            Err(MalformedCommand::UnknownOperation("get".into()))
        );
    }
}
