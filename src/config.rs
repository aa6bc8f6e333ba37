//! TOML configuration (spec §2.1).
//!
//! Loaded once at startup from the path given to `-c`; nothing here is
//! reloaded at runtime, matching the teacher's one-shot `parse_config`. Each
//! field may also be supplied as an environment variable of the same name
//! (upper-cased); the environment is read before the file, so the file only
//! fills in values the environment left unset (spec §6).

use anyhow::Result;
use log::warn;
use serde::Deserialize;
use std::{fs::File, io::Read, path::Path};

fn default_max_upload_bytes() -> u64 {
    170 * 1024 * 1024
}

fn default_cache_ttl_seconds() -> u64 {
    600
}

#[derive(Deserialize, Clone)]
pub struct SignerConfig {
    pub gnupg_path: Option<String>,
    pub gnupg_timestamp_url: Option<String>,
    pub gnupg_fingerprint: String,
}

#[derive(Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub data_path: String,
    pub bind_address: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Absolute base URL the catalog resolver prefixes onto stored paths to
    /// produce `link`/`thumbnail`/`snapshot` (spec §6, "URLs are absolute").
    pub public_base_url: String,
    pub signer: Option<SignerConfig>,
}

/// Warns about configuration that will parse fine but is probably a mistake.
pub fn lint_config(config: &Config) {
    if config.max_upload_bytes == 0 {
        warn!("max_upload_bytes is 0: every upload will be rejected");
    }
    if config.signer.is_none() {
        warn!("no [signer] table configured: uploaded packages will be served unsigned");
    }
}

/// Applies the `DATABASE_URL` / `DATA_PATH` / ... environment overrides
/// (spec §6) onto a raw TOML document before it is deserialized, so an
/// environment variable wins over whatever the file says for that key.
fn apply_env_overrides(doc: &mut toml::value::Table) {
    for key in [
        "database_url",
        "data_path",
        "bind_address",
        "max_upload_bytes",
        "cache_ttl_seconds",
        "public_base_url",
    ] {
        if let Ok(value) = std::env::var(key.to_uppercase()) {
            doc.insert(key.to_string(), toml::Value::String(value));
        }
    }

    if let Some(signer) = doc
        .entry("signer")
        .or_insert_with(|| toml::Value::Table(Default::default()))
        .as_table_mut()
    {
        for key in ["gnupg_path", "gnupg_timestamp_url", "gnupg_fingerprint"] {
            if let Ok(value) = std::env::var(key.to_uppercase()) {
                signer.insert(key.to_string(), toml::Value::String(value));
            }
        }
        if signer.is_empty() {
            doc.remove("signer");
        }
    }
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let mut f = File::open(path)?;
    let mut content = String::new();
    content.reserve(1024);
    f.read_to_string(&mut content)?;

    let mut doc: toml::value::Table = toml::from_str(&content)?;
    apply_env_overrides(&mut doc);

    Ok(Config::deserialize(toml::Value::Table(doc))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> toml::value::Table {
        toml::from_str(
            r#"
            database_url = "postgres://file"
            data_path = "/srv/spk"
            bind_address = "127.0.0.1:8080"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn env_override_wins_over_file() {
        std::env::set_var("DATABASE_URL", "postgres://env");
        let mut doc = sample_doc();
        apply_env_overrides(&mut doc);
        assert_eq!(
            doc.get("database_url").and_then(|v| v.as_str()),
            Some("postgres://env")
        );
        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    fn file_value_kept_when_env_unset() {
        std::env::remove_var("BIND_ADDRESS");
        let mut doc = sample_doc();
        apply_env_overrides(&mut doc);
        assert_eq!(
            doc.get("bind_address").and_then(|v| v.as_str()),
            Some("127.0.0.1:8080")
        );
    }

    #[test]
    fn signer_table_untouched_when_absent_and_no_env() {
        std::env::remove_var("GNUPG_PATH");
        std::env::remove_var("GNUPG_TIMESTAMP_URL");
        std::env::remove_var("GNUPG_FINGERPRINT");
        let mut doc = sample_doc();
        apply_env_overrides(&mut doc);
        assert!(!doc.contains_key("signer"));
    }

    #[test]
    fn signer_fields_overridden_from_env() {
        std::env::set_var("GNUPG_FINGERPRINT", "ABC123");
        let mut doc = sample_doc();
        apply_env_overrides(&mut doc);
        let signer = doc.get("signer").unwrap().as_table().unwrap();
        assert_eq!(
            signer.get("gnupg_fingerprint").and_then(|v| v.as_str()),
            Some("ABC123")
        );
        std::env::remove_var("GNUPG_FINGERPRINT");
    }
}
