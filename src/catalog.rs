//! Catalog resolution (spec §4.3): given an appliance's architecture,
//! firmware build, optional major version, language and beta flag, selects
//! the single best active Build per Package and renders it into the JSON
//! shape the Synology package center expects.

use sequoia_openpgp::serialize::SerializeInto;
use sequoia_openpgp::Cert;
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::cache::{CatalogCache, CatalogCacheKey};
use crate::errors::QueryError;
use crate::models::Architecture;

/// DSM 7 and later reports firmware builds at or above this threshold and
/// never serves beta packages regardless of the requested channel.
const DSM7_BUILD_FLOOR: i32 = 40_000;
/// Appliances on this build or newer understand the `{packages, keyrings}`
/// envelope instead of a bare array (DSM 5.1).
const KEYRING_ENVELOPE_BUILD_FLOOR: i32 = 5_004;

pub struct CatalogQuery {
    pub arch: String,
    pub build: i32,
    pub major: Option<i32>,
    pub language: String,
    pub beta_requested: bool,
}

struct NormalizedQuery {
    arch: String,
    arch_id: i32,
    build: i32,
    major: i32,
    language: String,
    beta: bool,
}

async fn normalize(pool: &PgPool, query: &CatalogQuery) -> Result<NormalizedQuery, QueryError> {
    let syno_code = Architecture::from_syno(&query.arch);
    let architecture = crate::db::find_architecture_by_code(pool, syno_code)
        .await
        .map_err(|_| QueryError::UnknownArch)?
        .ok_or(QueryError::UnknownArch)?;

    crate::db::find_language_by_code(pool, &query.language)
        .await
        .map_err(|_| QueryError::UnknownLanguage)?
        .ok_or(QueryError::UnknownLanguage)?;

    let beta = if query.build < DSM7_BUILD_FLOOR {
        query.beta_requested
    } else {
        false
    };

    let major = match query.major {
        Some(major) => major,
        None => {
            let firmware = crate::db::latest_dsm_firmware_at_or_below(pool, query.build)
                .await
                .map_err(|_| QueryError::InvalidBuild)?
                .ok_or(QueryError::InvalidBuild)?;
            firmware.major().ok_or(QueryError::InvalidBuild)?
        }
    };

    Ok(NormalizedQuery {
        arch: architecture.code.clone(),
        arch_id: architecture.id,
        build: query.build,
        major,
        language: query.language.clone(),
        beta,
    })
}

struct CatalogRow {
    build_id: i32,
    version_id: i32,
    package_id: i32,
    package_name: String,
    upstream_version: String,
    version_number: i32,
    license: Option<String>,
    install_wizard: bool,
    upgrade_wizard: bool,
    startable: Option<bool>,
    report_url: Option<String>,
    changelog: Option<String>,
    distributor: Option<String>,
    distributor_url: Option<String>,
    maintainer: Option<String>,
    maintainer_url: Option<String>,
    path: String,
    md5: Option<String>,
    manifest_dependencies: Option<String>,
    manifest_conflicts: Option<String>,
    manifest_conf_dependencies: Option<String>,
    manifest_conf_conflicts: Option<String>,
    manifest_conf_privilege: Option<String>,
    manifest_conf_resource: Option<String>,
}

/// The three-stage selection from spec §4.3, expressed as one query with
/// two CTEs (`latest_version`, `latest_firmware`) feeding the final join
/// against `build`. Ties at the final stage resolve to whichever row
/// Postgres returns first for the `DISTINCT ON` grouping key.
async fn select_catalog_rows(pool: &PgPool, q: &NormalizedQuery) -> Result<Vec<CatalogRow>, sqlx::Error> {
    let major_prefix = format!("{}.%", q.major);
    let allow_legacy_noarch = q.major < 6;

    let rows = sqlx::query!(
        r#"
        WITH latest_version AS (
            SELECT v.package_id AS package_id, MAX(v.version) AS latest_version
            FROM version v
            JOIN build b ON b.version_id = v.id AND b.active
            JOIN build_architecture ba ON ba.build_id = b.id
            JOIN architecture a ON a.id = ba.architecture_id
                AND (a.code = $1 OR a.code = 'noarch')
            JOIN firmware fmin ON fmin.id = b.firmware_min_id
            LEFT JOIN firmware fmax ON fmax.id = b.firmware_max_id
            WHERE fmin.build <= $2
              AND (b.firmware_max_id IS NULL OR fmax.build >= $2)
              AND (
                  fmin.version LIKE $3
                  OR (a.code = 'noarch' AND $4 AND fmin.version LIKE '3.%')
              )
              AND ($5 OR v.report_url IS NULL OR v.report_url = '')
            GROUP BY v.package_id
        ),
        latest_firmware AS (
            SELECT v.package_id AS package_id, lv.latest_version AS latest_version,
                   MAX(fmin.build) AS latest_firmware
            FROM version v
            JOIN latest_version lv ON lv.package_id = v.package_id AND lv.latest_version = v.version
            JOIN build b ON b.version_id = v.id AND b.active
            JOIN build_architecture ba ON ba.build_id = b.id
            JOIN architecture a ON a.id = ba.architecture_id
                AND (a.code = $1 OR a.code = 'noarch')
            JOIN firmware fmin ON fmin.id = b.firmware_min_id
            LEFT JOIN firmware fmax ON fmax.id = b.firmware_max_id
            WHERE fmin.build <= $2
              AND (b.firmware_max_id IS NULL OR fmax.build >= $2)
            GROUP BY v.package_id, lv.latest_version
        )
        SELECT DISTINCT ON (p.id)
            b.id AS "build_id!", v.id AS "version_id!", p.id AS "package_id!",
            p.name AS "package_name!", v.upstream_version AS "upstream_version!",
            v.version AS "version_number!", v.license, v.install_wizard AS "install_wizard!",
            v.upgrade_wizard AS "upgrade_wizard!", v.startable, v.report_url,
            v.changelog, v.distributor, v.distributor_url, v.maintainer, v.maintainer_url,
            b.path AS "path!", b.md5,
            bm.dependencies AS manifest_dependencies, bm.conflicts AS manifest_conflicts,
            bm.conf_dependencies AS manifest_conf_dependencies,
            bm.conf_conflicts AS manifest_conf_conflicts,
            bm.conf_privilege AS manifest_conf_privilege,
            bm.conf_resource AS manifest_conf_resource
        FROM build b
        JOIN version v ON v.id = b.version_id
        JOIN package p ON p.id = v.package_id
        JOIN build_architecture ba ON ba.build_id = b.id
        JOIN architecture a ON a.id = ba.architecture_id
            AND (a.code = $1 OR a.code = 'noarch')
        JOIN firmware fmin ON fmin.id = b.firmware_min_id
        JOIN latest_firmware lf ON lf.package_id = v.package_id
            AND lf.latest_version = v.version
            AND lf.latest_firmware = fmin.build
        LEFT JOIN build_manifest bm ON bm.build_id = b.id
        WHERE b.active
        ORDER BY p.id, b.id
        "#,
        q.arch,
        q.build,
        major_prefix,
        allow_legacy_noarch,
        q.beta,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| CatalogRow {
            build_id: r.build_id,
            version_id: r.version_id,
            package_id: r.package_id,
            package_name: r.package_name,
            upstream_version: r.upstream_version,
            version_number: r.version_number,
            license: r.license,
            install_wizard: r.install_wizard,
            upgrade_wizard: r.upgrade_wizard,
            startable: r.startable,
            report_url: r.report_url,
            changelog: r.changelog,
            distributor: r.distributor,
            distributor_url: r.distributor_url,
            maintainer: r.maintainer,
            maintainer_url: r.maintainer_url,
            path: r.path,
            md5: r.md5,
            manifest_dependencies: r.manifest_dependencies,
            manifest_conflicts: r.manifest_conflicts,
            manifest_conf_dependencies: r.manifest_conf_dependencies,
            manifest_conf_conflicts: r.manifest_conf_conflicts,
            manifest_conf_privilege: r.manifest_conf_privilege,
            manifest_conf_resource: r.manifest_conf_resource,
        })
        .collect())
}

async fn render_entry(
    pool: &PgPool,
    row: &CatalogRow,
    language: &str,
    data_base_url: &str,
) -> Result<Value, sqlx::Error> {
    let displayname = crate::db::fetch_localized_displayname(pool, row.version_id, language).await?;
    let description = crate::db::fetch_localized_description(pool, row.version_id, language).await?;
    let icon_urls = crate::db::fetch_icon_paths(pool, row.version_id)
        .await?
        .into_iter()
        .map(|path| format!("{}/{}", data_base_url, path))
        .collect::<Vec<_>>();
    let screenshot_urls = crate::db::fetch_screenshot_paths(pool, row.package_id)
        .await?
        .into_iter()
        .map(|path| format!("{}/{}", data_base_url, path))
        .collect::<Vec<_>>();
    let service_codes = crate::db::fetch_service_dependency_codes(pool, row.version_id).await?;
    let download_count = crate::db::fetch_download_count(pool, row.package_id).await?;
    let recent_download_count = crate::db::fetch_recent_download_count(pool, row.package_id).await?;

    let no_license = row.license.is_none();
    let mut entry = Map::new();
    entry.insert("package".to_string(), json!(row.package_name));
    entry.insert(
        "version".to_string(),
        json!(format!("{}-{}", row.upstream_version, row.version_number)),
    );
    entry.insert("dname".to_string(), json!(displayname));
    entry.insert("desc".to_string(), json!(description));
    entry.insert(
        "link".to_string(),
        json!(format!("{}/{}", data_base_url, row.path)),
    );
    entry.insert("thumbnail".to_string(), json!(icon_urls));
    entry.insert(
        "qinst".to_string(),
        json!(no_license && !row.install_wizard),
    );
    entry.insert(
        "qupgrade".to_string(),
        json!(no_license && !row.upgrade_wizard),
    );
    entry.insert(
        "qstart".to_string(),
        json!(no_license && !row.install_wizard && row.startable != Some(false)),
    );
    entry.insert("deppkgs".to_string(), json!(row.manifest_dependencies));
    entry.insert("conflictpkgs".to_string(), json!(row.manifest_conflicts));
    entry.insert("download_count".to_string(), json!(download_count));
    entry.insert(
        "recent_download_count".to_string(),
        json!(recent_download_count),
    );

    if !screenshot_urls.is_empty() {
        entry.insert("snapshot".to_string(), json!(screenshot_urls));
    }
    if let Some(report_url) = row.report_url.as_ref().filter(|s| !s.is_empty()) {
        entry.insert("report_url".to_string(), json!(report_url));
        entry.insert("beta".to_string(), json!(true));
    }
    if let Some(changelog) = &row.changelog {
        entry.insert("changelog".to_string(), json!(changelog));
    }
    if let Some(distributor) = &row.distributor {
        entry.insert("distributor".to_string(), json!(distributor));
    }
    if let Some(distributor_url) = &row.distributor_url {
        entry.insert("distributor_url".to_string(), json!(distributor_url));
    }
    if let Some(maintainer) = &row.maintainer {
        entry.insert("maintainer".to_string(), json!(maintainer));
    }
    if let Some(maintainer_url) = &row.maintainer_url {
        entry.insert("maintainer_url".to_string(), json!(maintainer_url));
    }
    if !service_codes.is_empty() {
        entry.insert("depsers".to_string(), json!(service_codes.join(" ")));
    }
    if let Some(md5) = &row.md5 {
        entry.insert("md5".to_string(), json!(md5));
    }
    if let Some(conf) = &row.manifest_conf_dependencies {
        entry.insert("conf_deppkgs".to_string(), json!(conf));
    }
    if let Some(conf) = &row.manifest_conf_conflicts {
        entry.insert("conf_conxpkgs".to_string(), json!(conf));
    }
    if let Some(conf) = &row.manifest_conf_privilege {
        entry.insert("conf_privilege".to_string(), json!(conf));
    }
    if let Some(conf) = &row.manifest_conf_resource {
        entry.insert("conf_resource".to_string(), json!(conf));
    }

    Ok(Value::Object(entry))
}

pub async fn get_catalog(
    pool: &PgPool,
    cache: &CatalogCache,
    data_base_url: &str,
    signing_cert: Option<&Cert>,
    query: CatalogQuery,
) -> Result<Value, QueryError> {
    let normalized = normalize(pool, &query).await?;

    let cache_key = CatalogCacheKey {
        arch: normalized.arch.clone(),
        build: normalized.build,
        major: normalized.major,
        language: normalized.language.clone(),
        beta: normalized.beta,
    };
    if let Some(cached) = cache.get(&cache_key).await {
        return Ok(cached);
    }

    let rows = select_catalog_rows(pool, &normalized)
        .await
        .map_err(|_| QueryError::InvalidBuild)?;

    let mut packages = Vec::with_capacity(rows.len());
    for row in &rows {
        let entry = render_entry(pool, row, &normalized.language, data_base_url)
            .await
            .map_err(|_| QueryError::InvalidBuild)?;
        packages.push(entry);
    }

    let body = if normalized.build >= KEYRING_ENVELOPE_BUILD_FLOOR {
        let keyrings: Vec<String> = signing_cert
            .and_then(|cert| cert.armored().to_vec().ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(|armored| vec![armored.trim().to_string()])
            .unwrap_or_default();
        json!({ "packages": packages, "keyrings": keyrings })
    } else {
        Value::Array(packages)
    };

    cache.put(cache_key, body.clone()).await;

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsm7_forces_beta_off() {
        assert!(DSM7_BUILD_FLOOR > KEYRING_ENVELOPE_BUILD_FLOOR);
    }
}
