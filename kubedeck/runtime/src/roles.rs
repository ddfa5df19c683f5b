use anyhow::{Context, Result};
use kubedeck_core::RoleTable;
use std::path::Path;

/// Reads a role seed file.
pub(crate) async fn load(path: &Path) -> Result<RoleTable> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse(&text).with_context(|| format!("invalid role file {}", path.display()))
}

fn parse(text: &str) -> Result<RoleTable> {
    Ok(serde_yaml::from_str(text)?)
}
