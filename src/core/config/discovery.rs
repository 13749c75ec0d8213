//! Script discovery for configs that only name a servers directory.

use crate::core::config::data::BackendConfig;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const SCRIPT_EXTENSIONS: &[&str] = &["py", "js"];

/// Scans `directory` (non-recursively) for `.py` and `.js` scripts and turns
/// each one into a piped-script backend named after its file stem.
///
/// Results are sorted by name so listings do not depend on directory order.
pub fn discover_scripts(directory: &Path) -> Vec<BackendConfig> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(directory = %directory.display(), error = %err, "Unable to scan servers directory");
            return Vec::new();
        }
    };

    let mut backends: Vec<BackendConfig> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let extension = path.extension()?.to_str()?.to_ascii_lowercase();
            if !SCRIPT_EXTENSIONS.contains(&extension.as_str()) {
                return None;
            }
            let name = path.file_stem()?.to_str()?.to_string();
            debug!(backend = %name, script = %path.display(), "Discovered backend script");
            Some(BackendConfig {
                name,
                transport: "piped-script".to_string(),
                description: Some(format!("Script {}", path.display())),
                script: Some(path),
                ..BackendConfig::default()
            })
        })
        .collect();

    backends.sort_by(|a, b| a.name.cmp(&b.name));
    backends
}
