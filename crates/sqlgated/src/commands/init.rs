use std::path::Path;

use anyhow::{Context, bail};
use sqlgate_core::ProxyConfig;

/// Write a scaffold `sqlgate.toml` to `path`.
pub fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let content = ProxyConfig::scaffold()
        .to_toml_string()
        .context("failed to render scaffold config")?;
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    println!("✓ Generated {}", path.display());
    Ok(())
}
