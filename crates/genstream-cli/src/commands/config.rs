use anyhow::{Context, Result};
use genstream_infrastructure::ConfigService;

pub fn path(config: &ConfigService) -> Result<()> {
    let path = config
        .config_path()
        .context("Failed to resolve config path")?;
    let status = if path.exists() { "" } else { " (not found, using defaults)" };
    println!("{}{}", path.display(), status);
    Ok(())
}

pub fn show(config: &ConfigService) -> Result<()> {
    let root = config.load().context("Failed to load configuration")?;
    let rendered = toml::to_string_pretty(&root).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
