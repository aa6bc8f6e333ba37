//! Entity types mirrored from the relational schema (see `migrations/`).
//!
//! These are plain data carriers fetched with `sqlx::query_as!`; none of them
//! own a connection or know how to persist themselves — that lives in `db.rs`
//! and `reconcile.rs`.

use std::collections::HashMap;

use serde::Serialize;

/// `{admin, package_admin, developer}` — consumed as predicates, never as a
/// class hierarchy (see design notes).
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_PACKAGE_ADMIN: &str = "package_admin";
pub const ROLE_DEVELOPER: &str = "developer";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Role {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Architecture {
    pub id: i32,
    pub code: String,
}

impl Architecture {
    /// Normalizes an appliance-reported code to the repository's canonical code.
    pub fn from_syno(code: &str) -> &str {
        match code {
            "88f6281" => "88f628x",
            "88f6282" => "88f628x",
            other => other,
        }
    }

    /// Maps the repository's canonical code back to the appliance-facing one.
    pub fn to_syno(code: &str) -> &str {
        match code {
            "88f628x" => "88f6281",
            other => other,
        }
    }

    pub fn matches_query(&self, queried: &str) -> bool {
        self.code == queried || self.code == "noarch"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "firmware_type", rename_all = "lowercase")]
pub enum FirmwareType {
    Dsm,
    Srm,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Firmware {
    pub id: i32,
    pub version: String,
    pub build: i32,
    #[sqlx(rename = "type")]
    pub firmware_type: FirmwareType,
}

impl Firmware {
    pub fn firmware_string(&self) -> String {
        format!("{}-{}", self.version, self.build)
    }

    pub fn major(&self) -> Option<i32> {
        self.version.split('.').next()?.parse().ok()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Language {
    pub id: i32,
    pub code: String,
    pub name: Option<String>,
}

pub const DEFAULT_LANGUAGE: &str = "enu";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Service {
    pub id: i32,
    pub code: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Package {
    pub id: i32,
    pub name: String,
    pub author_user_id: Option<i32>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Version {
    pub id: i32,
    pub package_id: i32,
    pub version: i32,
    pub upstream_version: String,
    pub changelog: Option<String>,
    pub report_url: Option<String>,
    pub distributor: Option<String>,
    pub distributor_url: Option<String>,
    pub maintainer: Option<String>,
    pub maintainer_url: Option<String>,
    pub install_wizard: bool,
    pub upgrade_wizard: bool,
    pub startable: Option<bool>,
    pub license: Option<String>,
}

impl Version {
    pub fn version_string(&self) -> String {
        format!("{}-{}", self.upstream_version, self.version)
    }

    pub fn is_beta(&self) -> bool {
        self.report_url.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn path(&self, package_name: &str) -> String {
        format!("{}/{}", package_name, self.version)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Build {
    pub id: i32,
    pub version_id: i32,
    pub firmware_min_id: i32,
    pub firmware_max_id: Option<i32>,
    pub publisher_user_id: Option<i32>,
    pub checksum: Option<String>,
    pub path: String,
    pub md5: Option<String>,
    pub active: bool,
}

impl Build {
    /// `<package>.v<version>.f<firmware_min.build>[<arch1>-<arch2>-...].spk`
    pub fn generate_filename(
        package_name: &str,
        version_number: i32,
        firmware_min_build: i32,
        architecture_codes: &[String],
    ) -> String {
        let mut sorted: Vec<&str> = architecture_codes.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        format!(
            "{}.v{}.f{}[{}].spk",
            package_name,
            version_number,
            firmware_min_build,
            sorted.join("-")
        )
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildManifest {
    pub build_id: i32,
    pub dependencies: Option<String>,
    pub conflicts: Option<String>,
    pub conf_dependencies: Option<String>,
    pub conf_conflicts: Option<String>,
    pub conf_privilege: Option<String>,
    pub conf_resource: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Icon {
    pub version_id: i32,
    pub size: String,
    pub path: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Screenshot {
    pub id: i32,
    pub package_id: i32,
    pub path: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Download {
    pub id: i32,
    pub build_id: i32,
    pub architecture_id: i32,
    pub firmware_build: i32,
    pub ip_address: String,
    pub user_agent: Option<String>,
}

/// Localized strings keyed by language code, as stored for a `Version`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalizedText(pub HashMap<String, String>);

impl LocalizedText {
    /// Prefers `language`, falls back to `enu`.
    pub fn resolve<'a>(&'a self, language: &str) -> Option<&'a str> {
        self.0
            .get(language)
            .or_else(|| self.0.get(DEFAULT_LANGUAGE))
            .map(String::as_str)
    }
}
