//! Config file loading and the `servers` command.

use anyhow::Context;
use mcup_client::{ClientConfig, ServerEntry};
use std::path::{Path, PathBuf};

/// Default location of the config file.
///
/// Linux: ~/.config/mcup/config.json
/// macOS: ~/Library/Application Support/mcup/config.json
/// Windows: %APPDATA%/mcup/config.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("mcup"))
        .unwrap_or_else(|| PathBuf::from(".mcup"))
        .join("config.json")
}

/// Load the config file.
///
/// An explicit path must exist. Without one, a missing default file means
/// an empty config.
pub async fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    if let Some(path) = path {
        return ClientConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    let path = default_config_path();
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(ClientConfig::default());
    }

    ClientConfig::load(&path)
        .await
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// Print the configured servers.
pub fn list_servers(config: &ClientConfig) {
    if config.servers.is_empty() {
        println!("No servers configured.");
        return;
    }

    let mut names: Vec<_> = config.servers.keys().collect();
    names.sort();

    println!("{:<20} {:<10} {}", "NAME", "TYPE", "ENDPOINT");
    println!("{}", "-".repeat(60));

    for name in names {
        let (kind, endpoint) = match &config.servers[name] {
            ServerEntry::Stdio(stdio) => {
                let mut parts = vec![stdio.command.clone()];
                parts.extend(stdio.args.iter().cloned());
                ("stdio", parts.join(" "))
            }
            ServerEntry::Websocket { url } => ("websocket", url.clone()),
        };
        println!("{:<20} {:<10} {}", name, kind, truncate(&endpoint, 30));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 30), "short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        // Multi-byte characters are not split.
        assert_eq!(truncate("ééééééééé", 6), "ééé...");
    }

    #[tokio::test]
    async fn test_load_explicit_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"servers": {"remote": {"type": "ws", "url": "ws://localhost:9000"}}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).await.unwrap();
        assert!(matches!(
            config.server("remote").unwrap(),
            ServerEntry::Websocket { .. }
        ));

        let missing = load_config(Some(&dir.path().join("missing.json"))).await;
        assert!(missing.is_err());
    }
}
