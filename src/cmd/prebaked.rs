//! Prebaked project listing: `progeny prebaked`.

use anyhow::Result;

use progeny::config::ProgenyConfig;
use progeny::spinner::prebaked::PrebakedCatalog;

pub fn cmd_prebaked(config: &ProgenyConfig) -> Result<()> {
    let Some(dir) = config.prebaked_dir() else {
        println!();
        println!("No prebaked directory configured. Set [prebaked] dir in progeny.toml.");
        println!();
        return Ok(());
    };

    let catalog = PrebakedCatalog::load(&dir)?;
    println!();
    if catalog.is_empty() {
        println!("No prebaked projects found in {}", dir.display());
        println!();
        return Ok(());
    }

    println!("{:<24} Command", "Name");
    println!("{:<24} -------", "------------------------");
    for project in catalog.projects() {
        println!("{:<24} {}", project.name, project.command());
        if !project.config.is_empty() {
            let config = serde_json::to_string(&project.config)?;
            println!("{:<24} {}", "", console::style(config).dim());
        }
    }
    println!();
    Ok(())
}
