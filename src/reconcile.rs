//! Upload reconciliation (spec §4.2): maps a [`ParsedSpk`] onto
//! `Package / Version / Build / BuildManifest` rows under the uniqueness,
//! authorization and architecture-conflict constraints, then persists the
//! icons and the SPK bytes under the data root before committing.
//!
//! The whole procedure runs inside one transaction (spec §5): parse → DB
//! inserts (uncommitted) → file writes → MD5 compute → commit. Any failure
//! after the file writes removes the files this upload created.

use std::path::{Path, PathBuf};

use faster_hex::hex_string;
use md5::Digest as _;
use sqlx::PgPool;
use tokio::fs;

use crate::auth::Principal;
use crate::errors::{AppError, ConflictError, UploadError};
use crate::models::{Architecture, Build};
use crate::sign::DetachedSigner;
use crate::spk::ParsedSpk;

mod md5 {
    pub use md_5::{Digest, Md5};
}

/// Result of a successful upload, echoed back to the client (spec §4.2).
pub struct ReconcileOutcome {
    pub package_name: String,
    pub version_string: String,
    pub firmware_string: String,
    pub architecture_codes: Vec<String>,
    pub build_id: i32,
}

/// Matches `^(\d\.\d)-(\d{3,6})$`, e.g. `3.1-1594`, without pulling in a
/// regex engine for one fixed shape — the same hand-rolled-grammar instinct
/// `parser.rs` applies to the INFO line format.
fn parse_firmware_spec(raw: &str) -> Option<(&str, i32)> {
    let (major_minor, build_str) = raw.split_once('-')?;
    let mut mm = major_minor.chars();
    let major = mm.next()?;
    if !major.is_ascii_digit() || mm.next()? != '.' {
        return None;
    }
    let minor = mm.next()?;
    if !minor.is_ascii_digit() || mm.next().is_some() {
        return None;
    }
    if !(3..=6).contains(&build_str.len()) || !build_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let build: i32 = build_str.parse().ok()?;
    Some((major_minor, build))
}

/// Matches `^(.*)-(\d+)$`: the version number is the integer suffix after
/// the *last* hyphen, everything before it is the free-form upstream string.
fn parse_version_spec(raw: &str) -> Option<(&str, i32)> {
    let dash = raw.rfind('-')?;
    let (upstream, number_str) = (&raw[..dash], &raw[dash + 1..]);
    if number_str.is_empty() || !number_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number: i32 = number_str.parse().ok()?;
    Some((upstream, number))
}

struct ResolvedFirmware {
    min_build: i32,
    max_build: Option<i32>,
}

/// Parses `info.firmware` (preferred) or `info.os_min_ver`, and optionally
/// `info.os_max_ver`, against the repository's firmware table.
///
/// Open question 9.1: an SPK carrying only `os_max_ver` is read the same
/// way `os_min_ver` is — there is no independent `firmware_max` key.
async fn resolve_firmware(pool: &PgPool, spk: &ParsedSpk) -> Result<ResolvedFirmware, AppError> {
    let min_raw = spk
        .get_str("firmware")
        .or_else(|| spk.get_str("os_min_ver"))
        .ok_or(UploadError::InvalidFirmware)?;
    let (_, min_build) = parse_firmware_spec(min_raw).ok_or(UploadError::InvalidFirmware)?;
    let min_firmware = crate::db::find_firmware_by_build(pool, min_build)
        .await
        .map_err(AppError::Other)?
        .ok_or(UploadError::UnknownFirmware)?;

    let max_build = match spk.get_str("os_max_ver") {
        Some(max_raw) => {
            let (_, max_build) = parse_firmware_spec(max_raw).ok_or(UploadError::InvalidFirmware)?;
            let max_firmware = crate::db::find_firmware_by_build(pool, max_build)
                .await
                .map_err(AppError::Other)?
                .ok_or(UploadError::UnknownFirmware)?;
            if max_firmware.build < min_firmware.build {
                return Err(UploadError::InvalidFirmware.into());
            }
            Some(max_firmware.build)
        }
        None => None,
    };

    Ok(ResolvedFirmware {
        min_build: min_firmware.build,
        max_build,
    })
}

async fn resolve_architectures(
    pool: &PgPool,
    spk: &ParsedSpk,
) -> Result<Vec<Architecture>, AppError> {
    let raw = spk.get_str("arch").ok_or(UploadError::InvalidVersion)?;
    let mut resolved = Vec::new();
    for token in raw.split_whitespace() {
        let repo_code = Architecture::from_syno(token);
        let arch = crate::db::find_architecture_by_code(pool, repo_code)
            .await
            .map_err(AppError::Other)?
            .ok_or_else(|| UploadError::UnknownArchitecture(token.to_string()))?;
        resolved.push(arch);
    }
    if resolved.is_empty() {
        return Err(UploadError::InvalidVersion.into());
    }
    Ok(resolved)
}

fn localized_map(spk: &ParsedSpk, prefix: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (key, value) in &spk.info {
        let Some(value) = value.as_str() else { continue };
        if key == prefix {
            out.push(("enu".to_string(), value.to_string()));
        } else if let Some(lang) = key.strip_prefix(&format!("{prefix}_")) {
            if lang.len() == 3 && lang.chars().all(|c| c.is_ascii_lowercase()) {
                out.push((lang.to_string(), value.to_string()));
            }
        }
    }
    out
}

/// `ctl_stop=no` is historically read as `startable=false` — the opposite
/// of a naive reading (spec §9, open question). Preserved as observed.
fn derive_startable(spk: &ParsedSpk) -> Option<bool> {
    if let Some(v) = spk.get_bool("startable") {
        return Some(v);
    }
    spk.get_bool("ctl_stop").map(|ctl_stop| !ctl_stop)
}

fn icon_size_name(size: &str) -> &'static str {
    match size {
        "72" => "icon_72.png",
        "120" => "icon_120.png",
        "256" => "icon_256.png",
        _ => "icon.png",
    }
}

async fn cleanup_partial_upload(data_root: &Path, written: &[PathBuf]) {
    for path in written {
        let _ = fs::remove_file(data_root.join(path)).await;
    }
}

pub struct UploadRequest<'a> {
    pub bytes: &'a [u8],
    pub data_root: &'a Path,
    pub principal: &'a Principal,
    pub signer: Option<&'a dyn DetachedSigner>,
}

/// The full upload pipeline (spec §4.2, steps 1-11).
pub async fn reconcile_upload(pool: &PgPool, req: UploadRequest<'_>) -> Result<ReconcileOutcome, AppError> {
    let spk = ParsedSpk::parse(req.bytes).map_err(AppError::Parse)?;
    if spk.signature.is_some() {
        return Err(UploadError::SignedUpload.into());
    }

    let architectures = resolve_architectures(pool, &spk).await?;
    let firmware = resolve_firmware(pool, &spk).await?;

    let package_name = spk.get_str("package").ok_or(UploadError::InvalidVersion)?;
    let existing_package = crate::db::find_package_by_name(pool, package_name)
        .await
        .map_err(AppError::Other)?;

    // Step 4 (spec §4.2): authorize before touching the database at all.
    if let Some(package) = &existing_package {
        let is_maintainer = crate::db::is_package_maintainer(pool, package.id, req.principal.user_id)
            .await
            .map_err(AppError::Other)?;
        if !(req.principal.can_administer_packages() || is_maintainer) {
            return Err(crate::errors::AuthError::InsufficientPermissions.into());
        }
    } else if !req.principal.can_administer_packages() {
        return Err(crate::errors::AuthError::NotDeveloper.into());
    }

    let version_raw = spk.get_str("version").ok_or(UploadError::InvalidVersion)?;
    let (upstream_version, version_number) =
        parse_version_spec(version_raw).ok_or(UploadError::InvalidVersion)?;
    let upstream_version = upstream_version.to_string();

    let mut tx = pool.begin().await.map_err(AppError::Database)?;

    let package_id = if let Some(package) = &existing_package {
        package.id
    } else {
        crate::db::insert_package(&mut tx, package_name, req.principal.user_id)
            .await
            .map_err(AppError::Other)?
            .id
    };

    let existing_version = sqlx::query_as!(
        crate::models::Version,
        r#"SELECT id, package_id, version, upstream_version, changelog, report_url,
                  distributor, distributor_url, maintainer, maintainer_url,
                  install_wizard, upgrade_wizard,
                  startable, license
           FROM version WHERE package_id = $1 AND version = $2"#,
        package_id,
        version_number
    )
    .fetch_optional(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    let requested_codes: Vec<String> = architectures.iter().map(|a| a.code.clone()).collect();

    let version_id = if let Some(version) = &existing_version {
        let bound = crate::db::architectures_bound_to_version_firmware(
            pool,
            version.id,
            firmware.min_build,
        )
        .await
        .map_err(AppError::Other)?;
        let conflicting: Vec<&String> = requested_codes.iter().filter(|c| bound.contains(c)).collect();
        if !conflicting.is_empty() {
            let codes = conflicting
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConflictError::ArchitectureConflict(codes).into());
        }
        version.id
    } else {
        let license = spk.license.as_deref();
        let version = crate::db::insert_version(
            &mut tx,
            package_id,
            version_number,
            &upstream_version,
            license,
            spk.wizards.contains(&crate::spk::Wizard::Install),
            spk.wizards.contains(&crate::spk::Wizard::Upgrade),
            derive_startable(&spk),
        )
        .await
        .map_err(AppError::Other)?;

        let displaynames = localized_map(&spk, "displayname");
        let descriptions = localized_map(&spk, "description");
        crate::db::replace_localized_text(&mut tx, version.id, &displaynames, &descriptions)
            .await
            .map_err(AppError::Other)?;

        let service_codes: Vec<String> = spk
            .get_str("install_dep_services")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        crate::db::replace_service_dependencies(&mut tx, version.id, &service_codes)
            .await
            .map_err(AppError::Other)?;

        version.id
    };

    let firmware_min_row = crate::db::find_firmware_by_build(pool, firmware.min_build)
        .await
        .map_err(AppError::Other)?
        .ok_or(UploadError::UnknownFirmware)?;
    let firmware_max_row = match firmware.max_build {
        Some(build) => Some(
            crate::db::find_firmware_by_build(pool, build)
                .await
                .map_err(AppError::Other)?
                .ok_or(UploadError::UnknownFirmware)?,
        ),
        None => None,
    };

    let filename = Build::generate_filename(
        package_name,
        version_number,
        firmware_min_row.build,
        &requested_codes,
    );
    let relative_path = format!("{}/{}/{}", package_name, version_number, filename);

    let mut architecture_key_codes = requested_codes.clone();
    architecture_key_codes.sort_unstable();
    let architecture_key = architecture_key_codes.join("-");

    let checksum = spk.get_str("checksum");
    let build = crate::db::insert_build(
        &mut tx,
        version_id,
        firmware_min_row.id,
        firmware_max_row.map(|f| f.id),
        Some(req.principal.user_id),
        checksum,
        &relative_path,
        &architecture_key,
    )
    .await
    .map_err(AppError::Other)?;

    crate::db::bind_build_architectures(
        &mut tx,
        build.id,
        &architectures.iter().map(|a| a.id).collect::<Vec<_>>(),
    )
    .await
    .map_err(AppError::Other)?;

    crate::db::upsert_build_manifest(
        &mut tx,
        build.id,
        spk.get_str("install_dep_packages"),
        spk.get_str("install_conflict_packages"),
        spk.conf_dependencies.as_deref(),
        spk.conf_conflicts.as_deref(),
        spk.conf_privilege.as_deref(),
        spk.conf_resource.as_deref(),
    )
    .await
    .map_err(AppError::Other)?;

    // --- filesystem side effects, before commit (spec §4.2 step 9) --------
    let package_dir = PathBuf::from(package_name);
    let version_dir = package_dir.join(version_number.to_string());
    let mut written = Vec::new();

    if let Err(err) = fs::create_dir_all(req.data_root.join(&version_dir)).await {
        return Err(AppError::Io(crate::errors::IoError::FilesystemWriteFailed)).map_err(|e| {
            log::error!("failed to create {}: {}", version_dir.display(), err);
            e
        });
    }

    let mut icon_paths = Vec::new();
    for (size, bytes) in &spk.icons {
        let icon_rel = version_dir.join(icon_size_name(size));
        if fs::write(req.data_root.join(&icon_rel), bytes).await.is_err() {
            cleanup_partial_upload(req.data_root, &written).await;
            return Err(crate::errors::IoError::FilesystemWriteFailed.into());
        }
        written.push(icon_rel.clone());
        icon_paths.push((size.clone(), icon_rel.to_string_lossy().to_string()));
    }
    crate::db::replace_icons(&mut tx, version_id, &icon_paths)
        .await
        .map_err(AppError::Other)?;

    let mut spk_bytes = req.bytes.to_vec();
    if let Some(signer) = req.signer {
        match crate::sign::sign_spk(&spk_bytes, signer) {
            Ok((signed, _signature)) => spk_bytes = signed,
            Err(_) => {
                cleanup_partial_upload(req.data_root, &written).await;
                return Err(crate::errors::IoError::SignFailed.into());
            }
        }
    }

    let build_rel = version_dir.join(&filename);
    if fs::write(req.data_root.join(&build_rel), &spk_bytes).await.is_err() {
        cleanup_partial_upload(req.data_root, &written).await;
        return Err(crate::errors::IoError::FilesystemWriteFailed.into());
    }
    written.push(build_rel.clone());

    let digest = hex_string(&md5::Md5::digest(&spk_bytes));
    crate::db::set_build_md5(&mut tx, build.id, &digest)
        .await
        .map_err(AppError::Other)?;

    if let Err(err) = tx.commit().await {
        cleanup_partial_upload(req.data_root, &written).await;
        return Err(AppError::Database(err));
    }

    Ok(ReconcileOutcome {
        package_name: package_name.to_string(),
        version_string: format!("{upstream_version}-{version_number}"),
        firmware_string: firmware_min_row.firmware_string(),
        architecture_codes: requested_codes,
        build_id: build.id,
    })
}

/// Re-syncs a persisted Build from its own stored file (spec §4.2,
/// "Re-sync" variant): re-applies steps 3-8 over the existing Package /
/// Version / Build, replacing localized text, icons, architectures,
/// firmware bounds and the manifest. Never creates or deletes entities.
pub async fn resync_build(
    pool: &PgPool,
    build_id: i32,
    principal: &Principal,
    data_root: &Path,
) -> Result<ReconcileOutcome, AppError> {
    if !principal.is_admin() {
        return Err(crate::errors::AuthError::InsufficientPermissions.into());
    }

    let build = crate::db::find_build_by_id(pool, build_id)
        .await
        .map_err(AppError::Other)?
        .ok_or(AppError::NotFound)?;
    let version = crate::db::find_version_by_id(pool, build.version_id)
        .await
        .map_err(AppError::Other)?
        .ok_or(AppError::NotFound)?;
    let package = crate::db::find_package_by_id(pool, version.package_id)
        .await
        .map_err(AppError::Other)?
        .ok_or(AppError::NotFound)?;

    let bytes = fs::read(data_root.join(&build.path))
        .await
        .map_err(|_| crate::errors::IoError::FilesystemWriteFailed)?;
    let spk = ParsedSpk::parse(&bytes).map_err(AppError::Parse)?;
    if spk.signature.is_some() {
        return Err(UploadError::SignedUpload.into());
    }

    let architectures = resolve_architectures(pool, &spk).await?;
    let firmware = resolve_firmware(pool, &spk).await?;
    let requested_codes: Vec<String> = architectures.iter().map(|a| a.code.clone()).collect();

    let firmware_min_row = crate::db::find_firmware_by_build(pool, firmware.min_build)
        .await
        .map_err(AppError::Other)?
        .ok_or(UploadError::UnknownFirmware)?;
    let firmware_max_row = match firmware.max_build {
        Some(build) => Some(
            crate::db::find_firmware_by_build(pool, build)
                .await
                .map_err(AppError::Other)?
                .ok_or(UploadError::UnknownFirmware)?,
        ),
        None => None,
    };

    let mut architecture_key_codes = requested_codes.clone();
    architecture_key_codes.sort_unstable();
    let architecture_key = architecture_key_codes.join("-");

    let mut tx = pool.begin().await.map_err(AppError::Database)?;

    let displaynames = localized_map(&spk, "displayname");
    let descriptions = localized_map(&spk, "description");
    crate::db::replace_localized_text(&mut tx, version.id, &displaynames, &descriptions)
        .await
        .map_err(AppError::Other)?;

    let service_codes: Vec<String> = spk
        .get_str("install_dep_services")
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    crate::db::replace_service_dependencies(&mut tx, version.id, &service_codes)
        .await
        .map_err(AppError::Other)?;

    crate::db::clear_build_architectures(&mut tx, build.id)
        .await
        .map_err(AppError::Other)?;
    crate::db::bind_build_architectures(
        &mut tx,
        build.id,
        &architectures.iter().map(|a| a.id).collect::<Vec<_>>(),
    )
    .await
    .map_err(AppError::Other)?;

    crate::db::update_build_firmware(
        &mut tx,
        build.id,
        firmware_min_row.id,
        firmware_max_row.as_ref().map(|f| f.id),
        &architecture_key,
        spk.get_str("checksum"),
    )
    .await
    .map_err(AppError::Other)?;

    crate::db::upsert_build_manifest(
        &mut tx,
        build.id,
        spk.get_str("install_dep_packages"),
        spk.get_str("install_conflict_packages"),
        spk.conf_dependencies.as_deref(),
        spk.conf_conflicts.as_deref(),
        spk.conf_privilege.as_deref(),
        spk.conf_resource.as_deref(),
    )
    .await
    .map_err(AppError::Other)?;

    let version_dir = PathBuf::from(&package.name).join(version.version.to_string());
    let mut icon_paths = Vec::new();
    for (size, icon_bytes) in &spk.icons {
        let icon_rel = version_dir.join(icon_size_name(size));
        if let Some(parent) = data_root.join(&icon_rel).parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        fs::write(data_root.join(&icon_rel), icon_bytes)
            .await
            .map_err(|_| crate::errors::IoError::FilesystemWriteFailed)?;
        icon_paths.push((size.clone(), icon_rel.to_string_lossy().to_string()));
    }
    crate::db::replace_icons(&mut tx, version.id, &icon_paths)
        .await
        .map_err(AppError::Other)?;

    let digest = hex_string(&md5::Md5::digest(&bytes));
    crate::db::set_build_md5(&mut tx, build.id, &digest)
        .await
        .map_err(AppError::Other)?;

    tx.commit().await.map_err(AppError::Database)?;

    Ok(ReconcileOutcome {
        package_name: package.name,
        version_string: version.version_string(),
        firmware_string: firmware_min_row.firmware_string(),
        architecture_codes: requested_codes,
        build_id: build.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spk_with_info(pairs: &[(&str, &str)]) -> ParsedSpk {
        let mut spk = ParsedSpk::default();
        for (k, v) in pairs {
            spk.info
                .insert(k.to_string(), crate::spk::InfoValue::Str(v.to_string()));
        }
        spk
    }

    #[test]
    fn startable_defaults_to_inverse_of_ctl_stop() {
        let mut spk = spk_with_info(&[]);
        spk.info
            .insert("ctl_stop".to_string(), crate::spk::InfoValue::Bool(false));
        assert_eq!(derive_startable(&spk), Some(true));

        let mut spk = spk_with_info(&[]);
        spk.info
            .insert("ctl_stop".to_string(), crate::spk::InfoValue::Bool(true));
        assert_eq!(derive_startable(&spk), Some(false));
    }

    #[test]
    fn explicit_startable_wins_over_ctl_stop() {
        let mut spk = spk_with_info(&[]);
        spk.info
            .insert("startable".to_string(), crate::spk::InfoValue::Bool(true));
        spk.info
            .insert("ctl_stop".to_string(), crate::spk::InfoValue::Bool(true));
        assert_eq!(derive_startable(&spk), Some(true));
    }

    #[test]
    fn localized_map_collects_default_and_language_variants() {
        let spk = spk_with_info(&[
            ("displayname", "NZBGet"),
            ("displayname_fre", "NZBGet FR"),
            ("description", "desc"),
        ]);
        let mut names = localized_map(&spk, "displayname");
        names.sort();
        assert_eq!(
            names,
            vec![
                ("enu".to_string(), "NZBGet".to_string()),
                ("fre".to_string(), "NZBGet FR".to_string())
            ]
        );
    }

    #[test]
    fn generated_filename_matches_spec_pattern() {
        let name = Build::generate_filename("nzbget", 11, 1594, &["88f628x".to_string()]);
        assert_eq!(name, "nzbget.v11.f1594[88f628x].spk");
    }
}
