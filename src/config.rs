//! Registry configuration (spec §6): merges CLI flags over `dotenvy`-loaded
//! environment variables, the way the teacher's `main.rs` already loads
//! `.env` before parsing `Args` — this just gives that merge a proper home
//! and widens the surface to every key spec §6 names.

use crate::utils::cli::Args;

#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub storge_type: String,
    pub root_dir: String,
    pub registry_url: String,
    pub db_url: String,
    pub password_salt: String,
    pub jwt_secret: String,
    pub jwt_lifetime_secs: i64,
    pub github_client_id: String,
    pub github_client_secret: String,

    /// `proxy.remote-url`: upstream registry base URL. Pull-through
    /// caching (`core::proxy`) is only enabled when this is set.
    pub proxy_remote_url: Option<String>,
    /// `proxy.username` / `proxy.password`: optional basic-auth
    /// credentials used to obtain upstream bearer tokens.
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    /// `proxy.ttl.blob` / `proxy.ttl.manifest`, in seconds (default 168h).
    pub proxy_ttl_blob_secs: u64,
    pub proxy_ttl_manifest_secs: u64,

    /// `scheduler.state-path`: overrides `core::paths::PathMapper`'s
    /// default `_state/scheduler.json` when set.
    pub scheduler_state_path: Option<String>,

    /// `upload.stale-cutoff`, in seconds (default 7 days): purge
    /// threshold for abandoned uploads.
    pub upload_stale_cutoff_secs: u64,

    /// `auth.trusted-issuers`, `auth.accepted-audiences`,
    /// `auth.trusted-keys`, `auth.roots`: token verification inputs
    /// consumed by the adapter. This registry issues its own HS256 JWTs
    /// rather than verifying third-party OIDC tokens, so these are
    /// recognized but only `auth.trusted-issuers`/`auth.accepted-audiences`
    /// are consulted (as informational claims on issued tokens); no
    /// external key material is fetched.
    pub auth_trusted_issuers: Vec<String>,
    pub auth_accepted_audiences: Vec<String>,

    /// `auth.trusted-keys`: HMAC secrets a manifest's detached signature
    /// set is verified against when `manifest.require-signatures` is set.
    pub auth_trusted_keys: Vec<String>,
    /// `manifest.require-signatures`: see spec §4.D `MANIFEST_UNVERIFIED`.
    pub manifest_require_signatures: bool,
    /// `proxy.min-throughput-bytes-per-sec`: sizes the per-remote-fetch
    /// deadline (spec §5).
    pub proxy_min_throughput_bps: u64,
}

/// Merges [`Args`] (clap, itself populated from `dotenvy`-loaded env vars
/// via each flag's `env` attribute) into a [`Config`], validating the
/// combinations spec §6 requires.
pub async fn validate_config(args: &Args) -> anyhow::Result<Config> {
    let proxy_username = args.proxy_username.clone();
    let proxy_password = args.proxy_password.clone();
    if proxy_username.is_some() != proxy_password.is_some() {
        anyhow::bail!("proxy.username and proxy.password must both be set or both be absent");
    }

    Ok(Config {
        host: args.host.clone(),
        port: args.port,
        storge_type: args.storage.clone(),
        root_dir: args.root.clone(),
        registry_url: args.registry_url.clone(),
        db_url: args.db_url.clone(),
        password_salt: args.password_salt.clone(),
        jwt_secret: args.jwt_secret.clone(),
        jwt_lifetime_secs: args.jwt_lifetime_secs,
        github_client_id: args.github_client_id.clone().unwrap_or_default(),
        github_client_secret: args.github_client_secret.clone().unwrap_or_default(),
        proxy_remote_url: args.proxy_remote_url.clone(),
        proxy_username,
        proxy_password,
        proxy_ttl_blob_secs: args.proxy_ttl_blob_secs,
        proxy_ttl_manifest_secs: args.proxy_ttl_manifest_secs,
        scheduler_state_path: args.scheduler_state_path.clone(),
        upload_stale_cutoff_secs: args.upload_stale_cutoff_secs,
        auth_trusted_issuers: split_csv(&args.auth_trusted_issuers),
        auth_accepted_audiences: split_csv(&args.auth_accepted_audiences),
        auth_trusted_keys: split_csv(&args.auth_trusted_keys),
        manifest_require_signatures: args.manifest_require_signatures,
        proxy_min_throughput_bps: args.proxy_min_throughput_bps,
    })
}

fn split_csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default()
}
