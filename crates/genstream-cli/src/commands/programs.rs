use anyhow::{Context, Result};
use genstream_infrastructure::ConfigService;

pub fn list(config: &ConfigService) -> Result<()> {
    let catalog = config.catalog().context("Failed to build program catalog")?;

    println!("{:<6} {:<9} {:>5} {:>10}  MODEL", "ID", "KIND", "STEPS", "SIZE");
    for spec in catalog.iter() {
        let size = format!("{}x{}", spec.width, spec.height);
        let overlay = spec
            .overlay
            .as_ref()
            .map(|o| format!(" + {}", o.id))
            .unwrap_or_default();
        println!(
            "{:<6} {:<9} {:>5} {:>10}  {}{}",
            spec.id.as_str(),
            spec.kind.to_string(),
            spec.inference_steps,
            size,
            spec.model_id,
            overlay
        );
    }
    Ok(())
}
