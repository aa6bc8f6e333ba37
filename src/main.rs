use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;

mod auth;
mod cache;
mod catalog;
mod cli;
mod config;
mod db;
mod errors;
mod http;
mod models;
mod parser;
mod reconcile;
mod sign;
mod spk;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: cli::SpkRepo = argh::from_env();
    let config = config::parse_config(&args.config)
        .with_context(|| format!("failed to read config file {}", args.config))?;
    config::lint_config(&config);

    match args.command {
        cli::SpkRepoCommand::Migrate(_) => {
            let pool = db::connect_database(&config.database_url).await?;
            info!("Running any pending migrations...");
            db::run_migrate(&pool).await?;
        }
        cli::SpkRepoCommand::Populate(_) => {
            let pool = db::connect_database(&config.database_url).await?;
            db::populate_reference_tables(&pool).await?;
        }
        cli::SpkRepoCommand::Reset(_) => {
            use dialoguer::theme::ColorfulTheme;
            use dialoguer::Confirm;

            let confirmed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("This will delete all existing data. Continue?")
                .default(false)
                .interact()?;
            if !confirmed {
                bail!("aborted");
            }
            let pool = db::connect_database(&config.database_url).await?;
            db::reset_database(&pool).await?;
        }
        cli::SpkRepoCommand::GenKey(gen_key) => generate_key(&gen_key.uid, &args.config).await?,
        cli::SpkRepoCommand::Serve(_) => serve(config).await?,
    }

    Ok(())
}

async fn serve(config: config::Config) -> Result<()> {
    info!("Connecting to database...");
    let pool = db::connect_database(&config.database_url).await?;
    info!("Running any pending migrations...");
    db::run_migrate(&pool).await?;

    let (signer, signing_cert) = load_signer(&config).await?;

    let bind_address = config.bind_address.clone();
    let state = Arc::new(http::AppState {
        pool,
        cache: cache::CatalogCache::new(config.cache_ttl_seconds),
        config,
        signer,
        signing_cert,
    });
    let app = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Listening on {}", bind_address);

    #[cfg(feature = "systemd")]
    {
        sd_notify::notify(true, &[sd_notify::NotifyState::Ready]).ok();
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Loads the signing certificate named by `[signer]` and wraps it as an
/// [`sign::AgentSigner`], or returns `(None, None)` when no signer is
/// configured — uploads then proceed unsigned (spec §2.1).
async fn load_signer(
    config: &config::Config,
) -> Result<(
    Option<Arc<dyn sign::DetachedSigner + Send + Sync>>,
    Option<sequoia_openpgp::Cert>,
)> {
    let Some(signer_config) = &config.signer else {
        return Ok((None, None));
    };
    let Some(cert_path) = &signer_config.gnupg_path else {
        log::warn!("[signer] is configured but gnupg_path is unset: serving unsigned");
        return Ok((None, None));
    };

    let cert = sign::load_certificate(cert_path)
        .with_context(|| format!("failed to load signing certificate from {cert_path}"))?;
    if cert.fingerprint().to_string() != signer_config.gnupg_fingerprint {
        bail!(
            "certificate at {} does not match the configured fingerprint",
            cert_path
        );
    }

    let timestamp_url = signer_config
        .gnupg_timestamp_url
        .clone()
        .context("gnupg_timestamp_url is required when [signer] is configured")?;
    let agent = sign::AgentSigner::new(cert.clone(), timestamp_url)?;

    Ok((
        Some(Arc::new(agent) as Arc<dyn sign::DetachedSigner + Send + Sync>),
        Some(cert),
    ))
}

/// Generates a new local signing certificate and prints the operator
/// instructions for wiring it into `[signer]` (spec §2.1, `gen-key`).
async fn generate_key(uid: &str, config_hint: &str) -> Result<()> {
    use secrecy::ExposeSecret;
    use time::macros::format_description;
    use time::OffsetDateTime;
    use tokio::fs::{create_dir_all, File};
    use tokio::io::AsyncWriteExt;
    use tokio::task::spawn_blocking;

    let keys_dir = Path::new(&std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
        .join("spk-repo-keys");
    create_dir_all(&keys_dir).await?;

    let userid = uid.to_string();
    let cert = spawn_blocking(move || sign::generate_certificate(&userid)).await??;

    let priv_path = keys_dir.join(format!("{}.key", cert.id));
    let pub_path = keys_dir.join(format!("{}.pub", cert.id));
    File::create(&priv_path)
        .await?
        .write_all(cert.privkey.expose_secret().as_ref())
        .await?;
    File::create(&pub_path)
        .await?
        .write_all(cert.pubkey.expose_secret().as_ref())
        .await?;

    let expiry = OffsetDateTime::from_unix_timestamp(cert.expiry.try_into().unwrap())?.format(
        &format_description!(
            "[year]-[month]-[day] [hour]:[minute] [offset_hour sign:mandatory]:[offset_minute]"
        ),
    )?;

    let instructions = sign::generate_instructions(
        pub_path.display().to_string(),
        priv_path.display().to_string(),
        expiry,
        config_hint,
    )?;
    println!("\n{}", instructions);

    Ok(())
}
