//! Database glue: connecting, migrating, seeding, and the lookup-table
//! queries shared by the reconciler and the catalog resolver.

use anyhow::Result;
use log::info;
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::models::{
    Architecture, Build, BuildManifest, Firmware, FirmwareType, Language, Package, Role, Service,
    User, Version,
};

/// Run all the pending migrations in the `migrations` directory.
pub async fn run_migrate(pool: &PgPool) -> Result<()> {
    Ok(sqlx::migrate!().run(pool).await?)
}

/// Connect to the database.
pub async fn connect_database(connspec: &str) -> Result<PgPool> {
    Ok(PgPool::connect(connspec).await?)
}

/// Erase everything and re-run migrations from scratch.
pub async fn reset_database(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    info!("Truncating all tables ...");
    tx.execute(
        "TRUNCATE TABLE download, build_manifest, build_architecture, build, icon, \
         displayname, description, version_service_dependency, version, screenshot, \
         package_user_maintainer, package, user_role, service, language, firmware, \
         architecture, role, \"user\", _sqlx_migrations CASCADE",
    )
    .await?;
    tx.commit().await?;
    info!("Running database garbage collection ...");
    sqlx::query("VACUUM").execute(pool).await?;
    run_migrate(pool).await?;
    info!("Reset done.");

    Ok(())
}

/// Seeds the reference tables with the same starter rows as the original
/// fixture (spec §3.1): architectures, firmwares, languages, roles, services.
pub async fn populate_reference_tables(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;

    for code in ["noarch", "cedarview", "88f628x", "qoriq"] {
        sqlx::query!(
            "INSERT INTO architecture (code) VALUES ($1) ON CONFLICT (code) DO NOTHING",
            code
        )
        .execute(&mut *tx)
        .await?;
    }

    for (version, build) in [("3.1", 1594i32), ("5.0", 4458i32)] {
        sqlx::query!(
            r#"INSERT INTO firmware (version, build, type) VALUES ($1, $2, 'dsm')
               ON CONFLICT (build) DO NOTHING"#,
            version,
            build
        )
        .execute(&mut *tx)
        .await?;
    }

    for (code, name) in [("enu", "English"), ("fre", "French")] {
        sqlx::query!(
            "INSERT INTO language (code, name) VALUES ($1, $2) ON CONFLICT (code) DO NOTHING",
            code,
            name
        )
        .execute(&mut *tx)
        .await?;
    }

    for name in [
        crate::models::ROLE_ADMIN,
        crate::models::ROLE_PACKAGE_ADMIN,
        crate::models::ROLE_DEVELOPER,
    ] {
        sqlx::query!(
            "INSERT INTO role (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
            name
        )
        .execute(&mut *tx)
        .await?;
    }

    for code in ["apache-web", "mysql"] {
        sqlx::query!(
            "INSERT INTO service (code) VALUES ($1) ON CONFLICT (code) DO NOTHING",
            code
        )
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    info!("Reference tables populated.");

    Ok(())
}

pub async fn find_user_by_api_key(pool: &PgPool, api_key: &str) -> Result<Option<User>> {
    let user = sqlx::query_as!(
        User,
        "SELECT id, username, api_key FROM \"user\" WHERE api_key = $1",
        api_key
    )
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn find_user_roles(pool: &PgPool, user_id: i32) -> Result<Vec<Role>> {
    let roles = sqlx::query_as!(
        Role,
        r#"SELECT r.id, r.name FROM role r
           INNER JOIN user_role ur ON ur.role_id = r.id
           WHERE ur.user_id = $1"#,
        user_id
    )
    .fetch_all(pool)
    .await?;
    Ok(roles)
}

pub async fn find_architecture_by_code(pool: &PgPool, code: &str) -> Result<Option<Architecture>> {
    let arch = sqlx::query_as!(
        Architecture,
        "SELECT id, code FROM architecture WHERE code = $1",
        code
    )
    .fetch_optional(pool)
    .await?;
    Ok(arch)
}

pub async fn find_firmware_by_build(pool: &PgPool, build: i32) -> Result<Option<Firmware>> {
    let firmware = sqlx::query_as!(
        Firmware,
        r#"SELECT id, version, build, type AS "firmware_type: FirmwareType" FROM firmware WHERE build = $1"#,
        build
    )
    .fetch_optional(pool)
    .await?;
    Ok(firmware)
}

pub async fn find_language_by_code(pool: &PgPool, code: &str) -> Result<Option<Language>> {
    let language = sqlx::query_as!(
        Language,
        "SELECT id, code, name FROM language WHERE code = $1",
        code
    )
    .fetch_optional(pool)
    .await?;
    Ok(language)
}

/// Most recent `dsm`-type firmware row whose build does not exceed `build`,
/// used to derive `major` when the query omits it (spec §4.3).
pub async fn latest_dsm_firmware_at_or_below(pool: &PgPool, build: i32) -> Result<Option<Firmware>> {
    let firmware = sqlx::query_as!(
        Firmware,
        r#"SELECT id, version, build, type AS "firmware_type: FirmwareType" FROM firmware
           WHERE type = 'dsm' AND build <= $1
           ORDER BY build DESC LIMIT 1"#,
        build
    )
    .fetch_optional(pool)
    .await?;
    Ok(firmware)
}

pub async fn find_package_by_name(pool: &PgPool, name: &str) -> Result<Option<Package>> {
    let package = sqlx::query_as!(
        Package,
        "SELECT id, name, author_user_id FROM package WHERE name = $1",
        name
    )
    .fetch_optional(pool)
    .await?;
    Ok(package)
}

pub async fn is_package_maintainer(pool: &PgPool, package_id: i32, user_id: i32) -> Result<bool> {
    let found = sqlx::query_scalar!(
        "SELECT 1 FROM package_user_maintainer WHERE package_id = $1 AND user_id = $2",
        package_id,
        user_id
    )
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

pub async fn find_version(pool: &PgPool, package_id: i32, version_number: i32) -> Result<Option<Version>> {
    let version = sqlx::query_as!(
        Version,
        r#"SELECT id, package_id, version, upstream_version, changelog, report_url,
                  distributor, distributor_url, maintainer, maintainer_url,
                  install_wizard, upgrade_wizard,
                  startable, license
           FROM version WHERE package_id = $1 AND version = $2"#,
        package_id,
        version_number
    )
    .fetch_optional(pool)
    .await?;
    Ok(version)
}

pub async fn find_service_by_code(pool: &PgPool, code: &str) -> Result<Option<Service>> {
    let service = sqlx::query_as!(Service, "SELECT id, code FROM service WHERE code = $1", code)
        .fetch_optional(pool)
        .await?;
    Ok(service)
}

/// Localized displayname for `version_id`, preferring `language` and
/// falling back to `enu` exactly as the catalog renderer requires.
pub async fn fetch_localized_displayname(
    pool: &PgPool,
    version_id: i32,
    language: &str,
) -> Result<String, sqlx::Error> {
    sqlx::query_scalar!(
        r#"SELECT d.displayname FROM displayname d
           JOIN language l ON l.id = d.language_id
           WHERE d.version_id = $1 AND l.code = $2
           UNION ALL
           SELECT d.displayname FROM displayname d
           JOIN language l ON l.id = d.language_id
           WHERE d.version_id = $1 AND l.code = 'enu'
           LIMIT 1"#,
        version_id,
        language
    )
    .fetch_one(pool)
    .await
}

pub async fn fetch_localized_description(
    pool: &PgPool,
    version_id: i32,
    language: &str,
) -> Result<String, sqlx::Error> {
    sqlx::query_scalar!(
        r#"SELECT d.description FROM description d
           JOIN language l ON l.id = d.language_id
           WHERE d.version_id = $1 AND l.code = $2
           UNION ALL
           SELECT d.description FROM description d
           JOIN language l ON l.id = d.language_id
           WHERE d.version_id = $1 AND l.code = 'enu'
           LIMIT 1"#,
        version_id,
        language
    )
    .fetch_one(pool)
    .await
}

pub async fn fetch_icon_paths(pool: &PgPool, version_id: i32) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar!(
        "SELECT path FROM icon WHERE version_id = $1 ORDER BY size",
        version_id
    )
    .fetch_all(pool)
    .await
}

pub async fn fetch_screenshot_paths(pool: &PgPool, package_id: i32) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar!(
        "SELECT path FROM screenshot WHERE package_id = $1 ORDER BY id",
        package_id
    )
    .fetch_all(pool)
    .await
}

pub async fn fetch_service_dependency_codes(
    pool: &PgPool,
    version_id: i32,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar!(
        r#"SELECT s.code FROM service s
           JOIN version_service_dependency vsd ON vsd.service_id = s.id
           WHERE vsd.version_id = $1
           ORDER BY s.code"#,
        version_id
    )
    .fetch_all(pool)
    .await
}

pub async fn fetch_download_count(pool: &PgPool, package_id: i32) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar!(
        r#"SELECT COUNT(*) AS "count!" FROM download dl
           JOIN build b ON b.id = dl.build_id
           JOIN version v ON v.id = b.version_id
           WHERE v.package_id = $1"#,
        package_id
    )
    .fetch_one(pool)
    .await
}

pub async fn fetch_recent_download_count(pool: &PgPool, package_id: i32) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar!(
        r#"SELECT COUNT(*) AS "count!" FROM download dl
           JOIN build b ON b.id = dl.build_id
           JOIN version v ON v.id = b.version_id
           WHERE v.package_id = $1 AND dl.date >= now() - INTERVAL '90 days'"#,
        package_id
    )
    .fetch_one(pool)
    .await
}

// --- Upload reconciler glue (spec §4.2) -----------------------------------
//
// Everything below runs inside the single transaction the reconciler opens
// for one upload; nothing here commits on its own.

pub async fn insert_package(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
    author_user_id: i32,
) -> Result<Package> {
    let package = sqlx::query_as!(
        Package,
        r#"INSERT INTO package (name, author_user_id) VALUES ($1, $2)
           RETURNING id, name, author_user_id"#,
        name,
        author_user_id
    )
    .fetch_one(&mut **tx)
    .await?;
    Ok(package)
}

/// Architecture codes already bound to some build of `version_id` under the
/// same `firmware_min_id` — the set the architecture-conflict check (spec
/// §4.2 step 6) intersects the upload's own architectures against.
pub async fn architectures_bound_to_version_firmware(
    pool: &PgPool,
    version_id: i32,
    firmware_min_id: i32,
) -> Result<Vec<String>> {
    let codes = sqlx::query_scalar!(
        r#"SELECT a.code FROM architecture a
           JOIN build_architecture ba ON ba.architecture_id = a.id
           JOIN build b ON b.id = ba.build_id
           WHERE b.version_id = $1 AND b.firmware_min_id = $2"#,
        version_id,
        firmware_min_id
    )
    .fetch_all(pool)
    .await?;
    Ok(codes)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_version(
    tx: &mut Transaction<'_, Postgres>,
    package_id: i32,
    version_number: i32,
    upstream_version: &str,
    license: Option<&str>,
    install_wizard: bool,
    upgrade_wizard: bool,
    startable: Option<bool>,
) -> Result<Version> {
    let version = sqlx::query_as!(
        Version,
        r#"INSERT INTO version
            (package_id, version, upstream_version, license, install_wizard, upgrade_wizard, startable)
           VALUES ($1, $2, $3, $4, $5, $6, $7)
           RETURNING id, package_id, version, upstream_version, changelog, report_url,
                     distributor, distributor_url, maintainer, maintainer_url,
                     install_wizard, upgrade_wizard, startable, license"#,
        package_id,
        version_number,
        upstream_version,
        license,
        install_wizard,
        upgrade_wizard,
        startable
    )
    .fetch_one(&mut **tx)
    .await?;
    Ok(version)
}

/// Replaces every localized displayname/description for `version_id`,
/// discarding prior entries first — the "replacing ... atomically" clause
/// of the re-sync procedure (spec §4.2), but also the straightforward path
/// for a brand new Version (nothing to discard).
pub async fn replace_localized_text(
    tx: &mut Transaction<'_, Postgres>,
    version_id: i32,
    displaynames: &[(String, String)],
    descriptions: &[(String, String)],
) -> Result<()> {
    sqlx::query!("DELETE FROM displayname WHERE version_id = $1", version_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query!("DELETE FROM description WHERE version_id = $1", version_id)
        .execute(&mut **tx)
        .await?;

    for (lang_code, text) in displaynames {
        let language_id = sqlx::query_scalar!(
            r#"SELECT id AS "id!" FROM language WHERE code = $1"#,
            lang_code
        )
        .fetch_one(&mut **tx)
        .await?;
        sqlx::query!(
            "INSERT INTO displayname (version_id, language_id, displayname) VALUES ($1, $2, $3)",
            version_id,
            language_id,
            text
        )
        .execute(&mut **tx)
        .await?;
    }

    for (lang_code, text) in descriptions {
        let language_id = sqlx::query_scalar!(
            r#"SELECT id AS "id!" FROM language WHERE code = $1"#,
            lang_code
        )
        .fetch_one(&mut **tx)
        .await?;
        sqlx::query!(
            "INSERT INTO description (version_id, language_id, description) VALUES ($1, $2, $3)",
            version_id,
            language_id,
            text
        )
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

pub async fn replace_icons(
    tx: &mut Transaction<'_, Postgres>,
    version_id: i32,
    icons: &[(String, String)],
) -> Result<()> {
    sqlx::query!("DELETE FROM icon WHERE version_id = $1", version_id)
        .execute(&mut **tx)
        .await?;
    for (size, path) in icons {
        sqlx::query!(
            "INSERT INTO icon (version_id, size, path) VALUES ($1, $2, $3)",
            version_id,
            size,
            path
        )
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn replace_service_dependencies(
    tx: &mut Transaction<'_, Postgres>,
    version_id: i32,
    service_codes: &[String],
) -> Result<()> {
    sqlx::query!(
        "DELETE FROM version_service_dependency WHERE version_id = $1",
        version_id
    )
    .execute(&mut **tx)
    .await?;
    for code in service_codes {
        let service_id = sqlx::query_scalar!(
            r#"SELECT id AS "id!" FROM service WHERE code = $1"#,
            code
        )
        .fetch_optional(&mut **tx)
        .await?;
        if let Some(service_id) = service_id {
            sqlx::query!(
                "INSERT INTO version_service_dependency (version_id, service_id) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
                version_id,
                service_id
            )
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_build(
    tx: &mut Transaction<'_, Postgres>,
    version_id: i32,
    firmware_min_id: i32,
    firmware_max_id: Option<i32>,
    publisher_user_id: Option<i32>,
    checksum: Option<&str>,
    path: &str,
    architecture_key: &str,
) -> Result<Build> {
    let build = sqlx::query_as!(
        Build,
        r#"INSERT INTO build
            (version_id, firmware_min_id, firmware_max_id, publisher_user_id, checksum, path, architecture_key)
           VALUES ($1, $2, $3, $4, $5, $6, $7)
           RETURNING id, version_id, firmware_min_id, firmware_max_id, publisher_user_id,
                     checksum, path, md5, active"#,
        version_id,
        firmware_min_id,
        firmware_max_id,
        publisher_user_id,
        checksum,
        path,
        architecture_key
    )
    .fetch_one(&mut **tx)
    .await?;
    Ok(build)
}

pub async fn bind_build_architectures(
    tx: &mut Transaction<'_, Postgres>,
    build_id: i32,
    architecture_ids: &[i32],
) -> Result<()> {
    for architecture_id in architecture_ids {
        sqlx::query!(
            "INSERT INTO build_architecture (build_id, architecture_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
            build_id,
            architecture_id
        )
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn clear_build_architectures(
    tx: &mut Transaction<'_, Postgres>,
    build_id: i32,
) -> Result<()> {
    sqlx::query!(
        "DELETE FROM build_architecture WHERE build_id = $1",
        build_id
    )
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn upsert_build_manifest(
    tx: &mut Transaction<'_, Postgres>,
    build_id: i32,
    dependencies: Option<&str>,
    conflicts: Option<&str>,
    conf_dependencies: Option<&str>,
    conf_conflicts: Option<&str>,
    conf_privilege: Option<&str>,
    conf_resource: Option<&str>,
) -> Result<BuildManifest> {
    let manifest = sqlx::query_as!(
        BuildManifest,
        r#"INSERT INTO build_manifest
            (build_id, dependencies, conflicts, conf_dependencies, conf_conflicts, conf_privilege, conf_resource)
           VALUES ($1, $2, $3, $4, $5, $6, $7)
           ON CONFLICT (build_id) DO UPDATE SET
               dependencies = EXCLUDED.dependencies,
               conflicts = EXCLUDED.conflicts,
               conf_dependencies = EXCLUDED.conf_dependencies,
               conf_conflicts = EXCLUDED.conf_conflicts,
               conf_privilege = EXCLUDED.conf_privilege,
               conf_resource = EXCLUDED.conf_resource
           RETURNING build_id, dependencies, conflicts, conf_dependencies, conf_conflicts,
                     conf_privilege, conf_resource"#,
        build_id,
        dependencies,
        conflicts,
        conf_dependencies,
        conf_conflicts,
        conf_privilege,
        conf_resource
    )
    .fetch_one(&mut **tx)
    .await?;
    Ok(manifest)
}

pub async fn set_build_md5(tx: &mut Transaction<'_, Postgres>, build_id: i32, md5: &str) -> Result<()> {
    sqlx::query!("UPDATE build SET md5 = $1 WHERE id = $2", md5, build_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Re-sync (spec §4.2) updates the firmware bounds and architecture_key of
/// an existing Build in place; it never touches `version_id` or `path`.
pub async fn update_build_firmware(
    tx: &mut Transaction<'_, Postgres>,
    build_id: i32,
    firmware_min_id: i32,
    firmware_max_id: Option<i32>,
    architecture_key: &str,
    checksum: Option<&str>,
) -> Result<()> {
    sqlx::query!(
        r#"UPDATE build SET firmware_min_id = $1, firmware_max_id = $2,
                            architecture_key = $3, checksum = $4
           WHERE id = $5"#,
        firmware_min_id,
        firmware_max_id,
        architecture_key,
        checksum,
        build_id
    )
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn set_build_active(pool: &PgPool, build_id: i32, active: bool) -> Result<Option<Build>> {
    let build = sqlx::query_as!(
        Build,
        r#"UPDATE build SET active = $1 WHERE id = $2
           RETURNING id, version_id, firmware_min_id, firmware_max_id, publisher_user_id,
                     checksum, path, md5, active"#,
        active,
        build_id
    )
    .fetch_optional(pool)
    .await?;
    Ok(build)
}

pub async fn find_build_by_id(pool: &PgPool, build_id: i32) -> Result<Option<Build>> {
    let build = sqlx::query_as!(
        Build,
        r#"SELECT id, version_id, firmware_min_id, firmware_max_id, publisher_user_id,
                  checksum, path, md5, active FROM build WHERE id = $1"#,
        build_id
    )
    .fetch_optional(pool)
    .await?;
    Ok(build)
}

pub async fn find_version_by_id(pool: &PgPool, version_id: i32) -> Result<Option<Version>> {
    let version = sqlx::query_as!(
        Version,
        r#"SELECT id, package_id, version, upstream_version, changelog, report_url,
                  distributor, distributor_url, maintainer, maintainer_url,
                  install_wizard, upgrade_wizard,
                  startable, license
           FROM version WHERE id = $1"#,
        version_id
    )
    .fetch_optional(pool)
    .await?;
    Ok(version)
}

pub async fn find_package_by_id(pool: &PgPool, package_id: i32) -> Result<Option<Package>> {
    let package = sqlx::query_as!(
        Package,
        "SELECT id, name, author_user_id FROM package WHERE id = $1",
        package_id
    )
    .fetch_optional(pool)
    .await?;
    Ok(package)
}

pub async fn find_architecture_by_id(pool: &PgPool, architecture_id: i32) -> Result<Option<Architecture>> {
    let arch = sqlx::query_as!(
        Architecture,
        "SELECT id, code FROM architecture WHERE id = $1",
        architecture_id
    )
    .fetch_optional(pool)
    .await?;
    Ok(arch)
}

pub async fn build_architecture_ids(pool: &PgPool, build_id: i32) -> Result<Vec<i32>> {
    let ids = sqlx::query_scalar!(
        r#"SELECT architecture_id AS "id!" FROM build_architecture WHERE build_id = $1"#,
        build_id
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn find_firmware_by_id(pool: &PgPool, firmware_id: i32) -> Result<Option<Firmware>> {
    let firmware = sqlx::query_as!(
        Firmware,
        r#"SELECT id, version, build, type AS "firmware_type: FirmwareType" FROM firmware WHERE id = $1"#,
        firmware_id
    )
    .fetch_optional(pool)
    .await?;
    Ok(firmware)
}

pub async fn insert_download(
    pool: &PgPool,
    build_id: i32,
    architecture_id: i32,
    firmware_build: i32,
    ip_address: &str,
    user_agent: Option<&str>,
) -> Result<()> {
    sqlx::query!(
        r#"INSERT INTO download (build_id, architecture_id, firmware_build, ip_address, user_agent)
           VALUES ($1, $2, $3, $4, $5)"#,
        build_id,
        architecture_id,
        firmware_build,
        ip_address,
        user_agent
    )
    .execute(pool)
    .await?;
    Ok(())
}
