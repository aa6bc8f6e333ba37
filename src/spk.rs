//! SPK parsing and validation (spec §4.1).
//!
//! Pure function: no database, no filesystem beyond the in-memory byte
//! slice handed in. [`ParsedSpk::parse`] either returns every piece of
//! metadata the reconciler needs, or one of the [`ParseError`] variants the
//! original source's `SPK` class raises, keyed to the same conditions.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};

use ini::Ini;
use serde_json::{Map, Value};

use crate::errors::ParseError;
use crate::parser::info_line;

const REQUIRED_INFO: &[&str] = &["package", "version", "arch", "displayname", "description"];
const BOOLEAN_INFO: &[&str] = &["ctl_stop", "startable", "support_conf_folder"];
const SIGNATURE_FILENAME: &str = "syno_signature.asc";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub enum Wizard {
    Install,
    Upgrade,
    Uninstall,
}

impl Wizard {
    fn from_str(s: &str) -> Option<Wizard> {
        match s {
            "install" => Some(Wizard::Install),
            "upgrade" => Some(Wizard::Upgrade),
            "uninstall" => Some(Wizard::Uninstall),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum InfoValue {
    Str(String),
    Bool(bool),
}

impl InfoValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            InfoValue::Str(s) => Some(s),
            InfoValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            InfoValue::Bool(b) => Some(*b),
            InfoValue::Str(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ParsedSpk {
    pub info: HashMap<String, InfoValue>,
    pub icons: HashMap<String, Vec<u8>>,
    pub wizards: HashSet<Wizard>,
    pub license: Option<String>,
    pub signature: Option<String>,
    pub conf_dependencies: Option<String>,
    pub conf_conflicts: Option<String>,
    pub conf_privilege: Option<String>,
    pub conf_resource: Option<String>,
}

impl ParsedSpk {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.info.get(key).and_then(InfoValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.info.get(key).and_then(InfoValue::as_bool)
    }
}

fn strip_dot_slash(name: &str) -> &str {
    name.strip_prefix("./").unwrap_or(name)
}

/// Reads every member of the tar archive into memory, keyed by its
/// (leading-`./`-stripped) path. A single pass, since the container is
/// small enough that random-access-by-name is simpler than re-opening the
/// stream for every recognized file.
fn collect_members(bytes: &[u8]) -> Result<HashMap<String, Vec<u8>>, ParseError> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut members = HashMap::new();
    let entries = archive.entries().map_err(|_| ParseError::InvalidSpk)?;
    for entry in entries {
        let mut entry = entry.map_err(|_| ParseError::InvalidSpk)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|_| ParseError::InvalidSpk)?
            .to_string_lossy()
            .to_string();
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|_| ParseError::InvalidSpk)?;
        members.insert(strip_dot_slash(&path).to_string(), buf);
    }
    Ok(members)
}

/// Parses `KEY="VALUE"` lines out of the INFO manifest, applying the
/// per-key interpretation rules (booleans, icons, the package-name regex)
/// as it goes. `icons` accumulates base64-embedded icons so the later
/// filename-based pass can still override them.
fn parse_info(
    content: &str,
    icons: &mut HashMap<String, Vec<u8>>,
) -> Result<HashMap<String, InfoValue>, ParseError> {
    let mut info = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (rest, (key, value)) =
            info_line(line.as_bytes()).map_err(|_| ParseError::InvalidInfo)?;
        if !rest.is_empty() {
            return Err(ParseError::InvalidInfo);
        }
        let key = std::str::from_utf8(key).map_err(|_| ParseError::InvalidInfo)?;
        let value = std::str::from_utf8(value).map_err(|_| ParseError::InvalidInfo)?;

        if key == "package_icon" || key == "package_icon_120" || key == "package_icon_256" {
            let size = match key {
                "package_icon" => "72",
                "package_icon_120" => "120",
                _ => "256",
            };
            use base64::Engine;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(value)
                .map_err(|_| ParseError::InvalidIcon(key.to_string()))?;
            icons.insert(size.to_string(), decoded);
        } else if BOOLEAN_INFO.contains(&key) {
            let parsed = match value {
                "yes" => true,
                "no" => false,
                _ => return Err(ParseError::InvalidBoolean(key.to_string())),
            };
            info.insert(key.to_string(), InfoValue::Bool(parsed));
        } else if key == "package" {
            if value.is_empty()
                || !value
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(ParseError::InvalidPackage);
            }
            info.insert(key.to_string(), InfoValue::Str(value.to_string()));
        } else {
            info.insert(key.to_string(), InfoValue::Str(value.to_string()));
        }
    }
    Ok(info)
}

fn match_icon_filename(name: &str) -> Option<&'static str> {
    match name {
        "PACKAGE_ICON.PNG" => Some("72"),
        "PACKAGE_ICON_120.PNG" => Some("120"),
        "PACKAGE_ICON_256.PNG" => Some("256"),
        _ => None,
    }
}

pub(crate) fn match_wizard_filename(name: &str) -> Option<Wizard> {
    let rest = name.strip_prefix("WIZARD_UIFILES/")?;
    for kind in [Wizard::Install, Wizard::Upgrade, Wizard::Uninstall] {
        let prefix = match kind {
            Wizard::Install => "install_uifile",
            Wizard::Upgrade => "upgrade_uifile",
            Wizard::Uninstall => "uninstall_uifile",
        };
        if let Some(tail) = rest.strip_prefix(prefix) {
            let tail = tail.strip_suffix(".sh").unwrap_or(tail);
            if tail.is_empty() {
                return Some(kind);
            }
            if let Some(lang) = tail.strip_prefix('_') {
                if lang.len() == 3 && lang.chars().all(|c| c.is_ascii_lowercase()) {
                    return Some(kind);
                }
            }
        }
    }
    None
}

/// Re-encodes an INI file's sections into `{section: {key: value, ...}}`,
/// preserving insertion order, as a compact JSON string. Observable and
/// must stay bit-for-bit stable (design notes §9).
fn ini_to_json(content: &str, which: &'static str) -> Result<String, ParseError> {
    let conf = Ini::load_from_str(content).map_err(|_| ParseError::InvalidJson(which))?;
    let mut sections = Map::new();
    for (section_name, props) in conf.iter() {
        let section_name = section_name.unwrap_or_default().to_string();
        let mut section_map = Map::new();
        for (key, value) in props.iter() {
            section_map.insert(key.to_string(), Value::String(value.to_string()));
        }
        sections.insert(section_name, Value::Object(section_map));
    }
    serde_json::to_string(&Value::Object(sections)).map_err(|_| ParseError::InvalidJson(which))
}

impl ParsedSpk {
    pub fn parse(bytes: &[u8]) -> Result<ParsedSpk, ParseError> {
        let members = collect_members(bytes)?;

        if !members.contains_key("INFO") {
            return Err(ParseError::MissingInfo);
        }
        if !members.contains_key("package.tgz") {
            return Err(ParseError::MissingPackageTgz);
        }

        let mut spk = ParsedSpk::default();

        if let Some(license) = members.get("LICENSE") {
            spk.license = Some(
                String::from_utf8(license.clone())
                    .map_err(|_| ParseError::WrongLicenseEncoding)?
                    .trim()
                    .to_string(),
            );
        }

        if let Some(signature) = members.get(SIGNATURE_FILENAME) {
            if !signature.is_ascii() {
                return Err(ParseError::WrongSignatureEncoding);
            }
            spk.signature = Some(
                String::from_utf8(signature.clone())
                    .map_err(|_| ParseError::WrongSignatureEncoding)?
                    .trim()
                    .to_string(),
            );
        }

        let info_content =
            String::from_utf8(members["INFO"].clone()).map_err(|_| ParseError::WrongInfoEncoding)?;
        spk.info = parse_info(&info_content, &mut spk.icons)?;

        let missing: Vec<&str> = REQUIRED_INFO
            .iter()
            .filter(|k| !spk.info.contains_key(**k))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ParseError::MissingInfoKeys(missing.join(", ")));
        }

        if spk.get_bool("support_conf_folder") == Some(true) {
            let has_conf_dir = members.contains_key("conf")
                || members.keys().any(|k| k.starts_with("conf/"));
            if !has_conf_dir {
                return Err(ParseError::MissingConf);
            }
            if let Some(raw) = members.get("conf/PKG_DEPS") {
                let text = String::from_utf8(raw.clone())
                    .map_err(|_| ParseError::WrongConfEncoding("conf/PKG_DEPS"))?;
                spk.conf_dependencies = Some(ini_to_json(&text, "conf/PKG_DEPS")?);
            }
            if let Some(raw) = members.get("conf/PKG_CONX") {
                let text = String::from_utf8(raw.clone())
                    .map_err(|_| ParseError::WrongConfEncoding("conf/PKG_CONX"))?;
                spk.conf_conflicts = Some(ini_to_json(&text, "conf/PKG_CONX")?);
            }
            if let Some(raw) = members.get("conf/privilege") {
                let text = String::from_utf8(raw.clone())
                    .map_err(|_| ParseError::WrongConfEncoding("conf/privilege"))?;
                serde_json::from_str::<Value>(&text)
                    .map_err(|_| ParseError::InvalidJson("conf/privilege"))?;
                spk.conf_privilege = Some(text);
            }
            if let Some(raw) = members.get("conf/resource") {
                let text = String::from_utf8(raw.clone())
                    .map_err(|_| ParseError::WrongConfEncoding("conf/resource"))?;
                serde_json::from_str::<Value>(&text)
                    .map_err(|_| ParseError::InvalidJson("conf/resource"))?;
                spk.conf_resource = Some(text);
            }
            if spk.conf_dependencies.is_none()
                && spk.conf_conflicts.is_none()
                && spk.conf_privilege.is_none()
                && spk.conf_resource.is_none()
            {
                return Err(ParseError::EmptyConf);
            }
        }

        if let Some(checksum) = spk.get_str("checksum") {
            let digest = faster_hex::hex_string(&<md5::Md5 as md5::Digest>::digest(
                &members["package.tgz"],
            ));
            if digest != checksum {
                return Err(ParseError::ChecksumMismatch);
            }
        }

        for (name, bytes) in &members {
            if let Some(size) = match_icon_filename(name) {
                spk.icons.insert(size.to_string(), bytes.clone());
            }
        }

        if !spk.icons.contains_key("72") {
            return Err(ParseError::Missing72pxIcon);
        }

        for name in members.keys() {
            if let Some(wizard) = match_wizard_filename(name) {
                spk.wizards.insert(wizard);
            }
        }

        Ok(spk)
    }
}

// `md5` does not exist as a crate name we depend on directly; the `md-5`
// crate exposes itself under the `md5` module path.
use md5 as _unused_marker;
mod md5 {
    pub use md_5::{Digest, Md5};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tar::{Builder, Header};

    fn add_file(builder: &mut Builder<Vec<u8>>, path: &str, content: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content).unwrap();
    }

    fn minimal_info() -> String {
        concat!(
            "package=\"nzbget\"\n",
            "version=\"13.0-11\"\n",
            "arch=\"88f6281\"\n",
            "displayname=\"NZBGet\"\n",
            "description=\"Usenet downloader\"\n",
        )
        .to_string()
    }

    fn build_minimal_spk() -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        add_file(&mut builder, "INFO", minimal_info().as_bytes());
        add_file(&mut builder, "package.tgz", b"fake-payload");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"\x89PNG-fake-72");
        builder.into_inner().unwrap()
    }

    #[test]
    fn parses_minimal_valid_spk() {
        let bytes = build_minimal_spk();
        let spk = ParsedSpk::parse(&bytes).expect("should parse");
        assert_eq!(spk.get_str("package"), Some("nzbget"));
        assert_eq!(spk.get_str("version"), Some("13.0-11"));
        assert!(spk.icons.contains_key("72"));
        assert!(spk.signature.is_none());
    }

    #[test]
    fn missing_info_fails() {
        let mut builder = Builder::new(Vec::new());
        add_file(&mut builder, "package.tgz", b"x");
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(
            ParsedSpk::parse(&bytes),
            Err(ParseError::MissingInfo)
        ));
    }

    #[test]
    fn missing_package_tgz_fails() {
        let mut builder = Builder::new(Vec::new());
        add_file(&mut builder, "INFO", minimal_info().as_bytes());
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(
            ParsedSpk::parse(&bytes),
            Err(ParseError::MissingPackageTgz)
        ));
    }

    #[test]
    fn missing_required_key_fails() {
        let mut builder = Builder::new(Vec::new());
        add_file(
            &mut builder,
            "INFO",
            b"package=\"nzbget\"\nversion=\"1-1\"\narch=\"88f6281\"\n",
        );
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(
            ParsedSpk::parse(&bytes),
            Err(ParseError::MissingInfoKeys(_))
        ));
    }

    #[test]
    fn invalid_package_name_fails() {
        let mut builder = Builder::new(Vec::new());
        add_file(
            &mut builder,
            "INFO",
            b"package=\"bad name!\"\nversion=\"1-1\"\narch=\"x\"\ndisplayname=\"d\"\ndescription=\"d\"\n",
        );
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(
            ParsedSpk::parse(&bytes),
            Err(ParseError::InvalidPackage)
        ));
    }

    #[test]
    fn missing_72px_icon_fails() {
        let mut builder = Builder::new(Vec::new());
        add_file(&mut builder, "INFO", minimal_info().as_bytes());
        add_file(&mut builder, "package.tgz", b"x");
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(
            ParsedSpk::parse(&bytes),
            Err(ParseError::Missing72pxIcon)
        ));
    }

    #[test]
    fn checksum_mismatch_fails() {
        let mut builder = Builder::new(Vec::new());
        let mut info = minimal_info();
        info.push_str("checksum=\"deadbeefdeadbeefdeadbeefdeadbeef\"\n");
        add_file(&mut builder, "INFO", info.as_bytes());
        add_file(&mut builder, "package.tgz", b"fake-payload");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(
            ParsedSpk::parse(&bytes),
            Err(ParseError::ChecksumMismatch)
        ));
    }

    #[test]
    fn checksum_match_succeeds() {
        use md5::Digest;
        let payload = b"fake-payload".to_vec();
        let digest = faster_hex::hex_string(&md5::Md5::digest(&payload));
        let mut builder = Builder::new(Vec::new());
        let mut info = minimal_info();
        info.push_str(&format!("checksum=\"{}\"\n", digest));
        add_file(&mut builder, "INFO", info.as_bytes());
        add_file(&mut builder, "package.tgz", &payload);
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        let bytes = builder.into_inner().unwrap();
        ParsedSpk::parse(&bytes).expect("checksum should match");
    }

    #[test]
    fn wizard_files_detected() {
        let mut builder = Builder::new(Vec::new());
        add_file(&mut builder, "INFO", minimal_info().as_bytes());
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        add_file(
            &mut builder,
            "WIZARD_UIFILES/install_uifile.sh",
            b"#!/bin/sh\n",
        );
        add_file(
            &mut builder,
            "WIZARD_UIFILES/upgrade_uifile_enu",
            b"upgrade",
        );
        let bytes = builder.into_inner().unwrap();
        let spk = ParsedSpk::parse(&bytes).unwrap();
        assert!(spk.wizards.contains(&Wizard::Install));
        assert!(spk.wizards.contains(&Wizard::Upgrade));
        assert!(!spk.wizards.contains(&Wizard::Uninstall));
    }

    #[test]
    fn boolean_info_parsed() {
        let mut builder = Builder::new(Vec::new());
        let mut info = minimal_info();
        info.push_str("ctl_stop=\"no\"\nstartable=\"yes\"\n");
        add_file(&mut builder, "INFO", info.as_bytes());
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        let bytes = builder.into_inner().unwrap();
        let spk = ParsedSpk::parse(&bytes).unwrap();
        assert_eq!(spk.get_bool("ctl_stop"), Some(false));
        assert_eq!(spk.get_bool("startable"), Some(true));
    }

    #[test]
    fn invalid_boolean_fails() {
        let mut builder = Builder::new(Vec::new());
        let mut info = minimal_info();
        info.push_str("ctl_stop=\"maybe\"\n");
        add_file(&mut builder, "INFO", info.as_bytes());
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(
            ParsedSpk::parse(&bytes),
            Err(ParseError::InvalidBoolean(_))
        ));
    }

    #[test]
    fn base64_icon_in_info_is_decoded() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"icon-bytes");
        let mut builder = Builder::new(Vec::new());
        let mut info = minimal_info();
        info.push_str(&format!("package_icon_120=\"{}\"\n", encoded));
        add_file(&mut builder, "INFO", info.as_bytes());
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        let bytes = builder.into_inner().unwrap();
        let spk = ParsedSpk::parse(&bytes).unwrap();
        assert_eq!(spk.icons.get("120").map(Vec::as_slice), Some(&b"icon-bytes"[..]));
    }

    #[test]
    fn conf_folder_required_when_flagged() {
        let mut builder = Builder::new(Vec::new());
        let mut info = minimal_info();
        info.push_str("support_conf_folder=\"yes\"\n");
        add_file(&mut builder, "INFO", info.as_bytes());
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(
            ParsedSpk::parse(&bytes),
            Err(ParseError::MissingConf)
        ));
    }

    #[test]
    fn conf_pkg_deps_reencoded_as_json() {
        let mut builder = Builder::new(Vec::new());
        let mut info = minimal_info();
        info.push_str("support_conf_folder=\"yes\"\n");
        add_file(&mut builder, "INFO", info.as_bytes());
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        add_file(&mut builder, "conf/PKG_DEPS", b"[mysql]\nversion = 5.7\n");
        let bytes = builder.into_inner().unwrap();
        let spk = ParsedSpk::parse(&bytes).unwrap();
        let json = spk.conf_dependencies.unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["mysql"]["version"], "5.7");
    }

    #[test]
    fn invalid_privilege_json_fails() {
        let mut builder = Builder::new(Vec::new());
        let mut info = minimal_info();
        info.push_str("support_conf_folder=\"yes\"\n");
        add_file(&mut builder, "INFO", info.as_bytes());
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        add_file(&mut builder, "conf/privilege", b"not json");
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(
            ParsedSpk::parse(&bytes),
            Err(ParseError::InvalidJson("conf/privilege"))
        ));
    }

    #[test]
    fn signature_is_read() {
        let mut builder = Builder::new(Vec::new());
        add_file(&mut builder, "INFO", minimal_info().as_bytes());
        add_file(&mut builder, "package.tgz", b"x");
        add_file(&mut builder, "PACKAGE_ICON.PNG", b"x");
        add_file(
            &mut builder,
            SIGNATURE_FILENAME,
            b"-----BEGIN PGP SIGNATURE-----\nfake\n-----END PGP SIGNATURE-----\n",
        );
        let bytes = builder.into_inner().unwrap();
        let spk = ParsedSpk::parse(&bytes).unwrap();
        assert!(spk.signature.is_some());
    }

    #[allow(dead_code)]
    fn silence_unused_write_import() {
        let _ = std::io::sink().write_all(b"");
    }
}
