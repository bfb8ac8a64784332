pub mod doctor;
pub mod query;
pub mod run;
pub mod serve;

use std::io::Read;
use std::path::Path;

use rlm_config::AppConfig;

/// Load from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_with_path(path),
        None => AppConfig::load(),
    }
    .map_err(|e| format!("Failed to load config: {e}"))?;
    Ok(config)
}

/// `-` means "read the prompt from stdin".
pub fn read_prompt(arg: String) -> Result<String, Box<dyn std::error::Error>> {
    if arg != "-" {
        return Ok(arg);
    }
    let mut prompt = String::new();
    std::io::stdin().read_to_string(&mut prompt)?;
    Ok(prompt)
}
