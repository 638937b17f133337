//! Which server a command talks to.

use anyhow::Context;
use clap::Args;
use mcup_client::{ClientConfig, ServerEntry, StdioServerConfig};

/// Server selection shared by every command that connects.
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Named server from the config file
    #[arg(short, long, conflicts_with = "ws")]
    pub server: Option<String>,

    /// WebSocket URL
    #[arg(long)]
    pub ws: Option<String>,

    /// Command that starts a stdio server, after `--`
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl TargetArgs {
    /// Turn the flags into a server entry.
    pub fn resolve(&self, config: &ClientConfig) -> anyhow::Result<ServerEntry> {
        let chosen = [
            self.server.is_some(),
            self.ws.is_some(),
            !self.command.is_empty(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();

        if chosen > 1 {
            anyhow::bail!("Use only one of --server, --ws, or -- <command>");
        }

        if let Some(name) = &self.server {
            return config
                .server(name)
                .cloned()
                .with_context(|| format!("Server '{name}' is not in the config file"));
        }

        if let Some(url) = &self.ws {
            return Ok(ServerEntry::Websocket { url: url.clone() });
        }

        match self.command.split_first() {
            Some((command, args)) => Ok(ServerEntry::Stdio(StdioServerConfig::new(
                command.clone(),
                args.to_vec(),
            ))),
            None => match config.servers.len() {
                // A single configured server needs no flag.
                1 => config.servers.values().next().cloned().context("No servers"),
                0 => anyhow::bail!("No server given. Use --server, --ws, or -- <command>"),
                _ => anyhow::bail!("Several servers are configured. Pick one with --server"),
            },
        }
    }
}
