//! `COMMAND[;ARG]*` payloads exchanged by the client and server binaries.
//!
//! The transports never look inside a payload; this is only for the code
//! that dispatches on commands.

use std::fmt;
use std::num::ParseFloatError;

pub const SERVER_CONNECT: &str = "SERVER-CONNECT";
pub const SERVER_WARNING: &str = "SERVER-WARNING";
pub const REQUEST_TOPOLOGY: &str = "REQUEST/TOPOLOGY";
pub const REQUEST_CONFIG: &str = "REQUEST/CONFIG";
pub const REQUEST_HEATMAP_DATA: &str = "REQUEST/HEATMAP-DATA";
pub const TOPOLOGY: &str = "TOPOLOGY";
pub const CONFIG: &str = "CONFIG";
pub const HEATMAP_DATA: &str = "HEATMAP-DATA";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub command: String,
    pub args: Vec<String>,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Split a payload on `;`. Returns `None` for an empty payload.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(payload);
        let mut fields = text.split(';');
        let command = fields.next()?.to_string();
        Some(Self {
            command,
            args: fields.map(str::to_string).collect(),
        })
    }

    pub fn is(&self, command: &str) -> bool {
        self.command == command
    }

    /// Arguments as numbers, e.g. the samples of `HEATMAP-DATA`.
    pub fn float_args(&self) -> Result<Vec<f32>, ParseFloatError> {
        self.args.iter().map(|a| a.trim().parse()).collect()
    }

    pub fn to_payload(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for arg in &self.args {
            write!(f, ";{arg}")?;
        }
        Ok(())
    }
}
