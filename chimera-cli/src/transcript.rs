//! JSONL transcripts for `chimera replay`
//!
//! One turn per line:
//!
//! ```text
//! {"user_id": 1, "role": "user", "content": "My name is Alice"}
//! {"user_id": 1, "role": "assistant", "content": "Nice to meet you", "mode": "chat"}
//! ```

use anyhow::{Context, Result};
use chimera_core::prelude::{Role, UserId};
use serde::Deserialize;
use std::path::Path;

fn default_mode() -> String {
    "auto".to_string()
}

/// One recorded turn
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TranscriptLine {
    pub user_id: UserId,
    pub role: Role,
    pub content: String,
    #[serde(default = "default_mode")]
    pub mode: String,
}

/// Parse a transcript. Blank lines and lines starting with `#` are skipped.
pub fn parse(text: &str) -> Result<Vec<TranscriptLine>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("invalid transcript line {}", index + 1))
        })
        .collect()
}

/// Read and parse a transcript file
pub async fn load(path: &Path) -> Result<Vec<TranscriptLine>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse(&text)
}
