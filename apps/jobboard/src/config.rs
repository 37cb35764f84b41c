use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use session_core::{hosted::DEFAULT_PROFILES_TABLE, DEFAULT_SIGN_OUT_PATH};

pub const DEFAULT_CONFIG_FILE: &str = "jobboard.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub auth_url: String,
    pub api_key: String,
    pub profiles_table: String,
    pub session_file: PathBuf,
    pub sign_out_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auth_url: "http://127.0.0.1:54321".into(),
            api_key: String::new(),
            profiles_table: DEFAULT_PROFILES_TABLE.into(),
            session_file: default_session_file(),
            sign_out_path: DEFAULT_SIGN_OUT_PATH.into(),
        }
    }
}

fn default_session_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobboard")
        .join("session.json")
}

/// Defaults, then `jobboard.toml` (or the given file), then environment.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => load_settings_with(path, true, |key| std::env::var(key).ok()),
        None => load_settings_with(Path::new(DEFAULT_CONFIG_FILE), false, |key| {
            std::env::var(key).ok()
        }),
    }
}

fn load_settings_with(
    path: &Path,
    required: bool,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg = toml::from_str::<HashMap<String, String>>(&raw)
                .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
            if let Some(v) = file_cfg.get("auth_url") {
                settings.auth_url = v.clone();
            }
            if let Some(v) = file_cfg.get("api_key") {
                settings.api_key = v.clone();
            }
            if let Some(v) = file_cfg.get("profiles_table") {
                settings.profiles_table = v.clone();
            }
            if let Some(v) = file_cfg.get("session_file") {
                settings.session_file = PathBuf::from(v);
            }
            if let Some(v) = file_cfg.get("sign_out_path") {
                settings.sign_out_path = v.clone();
            }
        }
        Err(err) if err.kind() == ErrorKind::NotFound && !required => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    }

    if let Some(v) = env("JOBBOARD_AUTH_URL") {
        settings.auth_url = v;
    }
    if let Some(v) = env("APP__AUTH_URL") {
        settings.auth_url = v;
    }

    if let Some(v) = env("JOBBOARD_API_KEY") {
        settings.api_key = v;
    }
    if let Some(v) = env("APP__API_KEY") {
        settings.api_key = v;
    }

    if let Some(v) = env("APP__PROFILES_TABLE") {
        settings.profiles_table = v;
    }
    if let Some(v) = env("APP__SESSION_FILE") {
        settings.session_file = PathBuf::from(v);
    }
    if let Some(v) = env("APP__SIGN_OUT_PATH") {
        settings.sign_out_path = v;
    }

    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<()> {
    if settings.auth_url.trim().is_empty() {
        return Err(anyhow!("auth_url must not be empty"));
    }
    if settings.profiles_table.trim().is_empty() {
        return Err(anyhow!("profiles_table must not be empty"));
    }
    if !settings.sign_out_path.starts_with('/') {
        return Err(anyhow!(
            "sign_out_path must be an absolute path, got '{}'",
            settings.sign_out_path
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
