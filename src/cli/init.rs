use std::error::Error;
use std::path::Path;

use crate::core::config::data::{path_display, Config};

/// Writes the starter config to `path`. Existing files are kept unless
/// `force` is set.
pub fn write_starter_config(path: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        return Err(format!(
            "Config already exists at {} (use --force to overwrite)",
            path_display(path)
        )
        .into());
    }

    let servers_directory = path
        .parent()
        .map(|dir| dir.join("servers"))
        .unwrap_or_else(|| "servers".into());
    Config::starter(servers_directory.clone()).save_to_path(path)?;

    println!("✅ Wrote starter config to {}", path_display(path));
    println!(
        "   Put tool-provider scripts in {} or edit [[servers.instances]].",
        path_display(&servers_directory)
    );
    Ok(())
}
