//! Cache keys for pooled agent handles.
//!
//! Keys are structured values, so matching never depends on splitting a joined
//! string. The printable form length-prefixes every segment, which keeps it
//! unambiguous even when a working directory contains the separator.

use std::fmt;
use std::path::Path;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// How a worker is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// One local command-line process per invocation.
    Process,
    /// Remote HTTP API.
    Http,
    /// Long-lived child process speaking JSON-RPC over stdio.
    ToolServer,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Process => "process",
            Transport::Http => "http",
            Transport::ToolServer => "tool_server",
        }
    }

    /// True for transports bound to a local working directory.
    pub fn is_local_process(self) -> bool {
        matches!(self, Transport::Process | Transport::ToolServer)
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "process" => Some(Transport::Process),
            "http" => Some(Transport::Http),
            "tool_server" => Some(Transport::ToolServer),
            _ => None,
        }
    }
}

/// Identity of one cached handle: transport, resolved worker name, and the
/// execution context (working directory or endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub transport: Transport,
    pub name: String,
    pub context: String,
}

impl PoolKey {
    pub fn new(transport: Transport, name: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            transport,
            name: name.into(),
            context: context.into(),
        }
    }

    pub fn for_dir(transport: Transport, name: impl Into<String>, dir: &Path) -> Self {
        Self::new(transport, name, dir.to_string_lossy())
    }

    /// True if this key is bound to `dir`.
    pub fn is_bound_to(&self, dir: &Path) -> bool {
        self.context == dir.to_string_lossy()
    }

    /// Printable encoding `<transport>:<len>:<name><len>:<context>`.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}{}:{}",
            self.transport.as_str(),
            self.name.len(),
            self.name,
            self.context.len(),
            self.context
        )
    }

    /// Inverse of [`PoolKey::encode`].
    pub fn decode(raw: &str) -> Result<Self> {
        let (transport_raw, rest) = raw
            .split_once(':')
            .ok_or_else(|| anyhow!("pool key missing transport: '{raw}'"))?;
        let transport = Transport::parse(transport_raw)
            .ok_or_else(|| anyhow!("unknown transport '{transport_raw}' in pool key"))?;
        let (name, rest) = take_segment(rest)?;
        let (context, rest) = take_segment(rest)?;
        if !rest.is_empty() {
            return Err(anyhow!("trailing data in pool key: '{raw}'"));
        }
        Ok(Self::new(transport, name, context))
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn take_segment(raw: &str) -> Result<(&str, &str)> {
    let (len_raw, rest) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("pool key segment missing length: '{raw}'"))?;
    let len: usize = len_raw
        .parse()
        .map_err(|_| anyhow!("invalid pool key segment length '{len_raw}'"))?;
    if rest.len() < len || !rest.is_char_boundary(len) {
        return Err(anyhow!("pool key segment shorter than declared length {len}"));
    }
    Ok(rest.split_at(len))
}
