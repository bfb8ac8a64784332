//! `rlm doctor`: Diagnose configuration.

use std::path::{Path, PathBuf};

use rlm_config::AppConfig;
use rlm_environments::EnvironmentRegistry;

/// Whether `program` names an existing file or is found on `PATH`.
fn on_path(program: &str) -> bool {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return direct.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir: PathBuf| dir.join(program).is_file())
        })
        .unwrap_or(false)
}

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 RLM Doctor — Configuration Diagnostics");
    println!("=========================================\n");

    let mut issues = 0;

    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
    if path.exists() {
        println!("  ✅ Config file found: {}", path.display());
    } else {
        println!("  ⚠️  No config file at {} (using defaults)", path.display());
    }

    let config = match AppConfig::load_with_path(&path) {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  ⚠️  1 issue(s) found. See above for details.");
            return Ok(());
        }
    };

    for backend in std::iter::once(&config.backend).chain(&config.other_backends) {
        if backend == "ollama" || config.api_key_for(backend).is_some() {
            println!("  ✅ Credentials for backend '{backend}'");
        } else {
            println!("  ❌ No API key for backend '{backend}' — set RLM_API_KEY or api_key");
            issues += 1;
        }
    }

    let kinds = EnvironmentRegistry::with_defaults().kinds().join(", ");
    match config.environment.kind.as_str() {
        "local" => {
            if on_path(&config.environment.interpreter) {
                println!("  ✅ Interpreter '{}' found", config.environment.interpreter);
            } else {
                println!(
                    "  ❌ Interpreter '{}' not found on PATH",
                    config.environment.interpreter
                );
                issues += 1;
            }
        }
        "remote" => match &config.environment.url {
            Some(url) => println!("  ✅ Remote sandbox: {url}"),
            None => {
                println!("  ❌ Remote environment without environment.url");
                issues += 1;
            }
        },
        other => {
            println!("  ❌ Unknown environment kind '{other}' (available: {kinds})");
            issues += 1;
        }
    }

    match std::net::TcpListener::bind((config.handler.host.as_str(), config.handler.port)) {
        Ok(listener) => {
            let addr = listener.local_addr()?;
            println!("  ✅ Router can bind {}:{}", config.handler.host, addr.port());
        }
        Err(e) => {
            println!(
                "  ❌ Router cannot bind {}:{}: {e}",
                config.handler.host, config.handler.port
            );
            issues += 1;
        }
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
