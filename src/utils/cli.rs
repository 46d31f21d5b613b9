use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub(crate) struct Args {
    /// Registry listening host
    #[arg(long, env = "REGISTRY_HOST", default_value = "127.0.0.1")]
    pub(crate) host: String,

    /// Registry listening port
    #[arg(short, long, env = "REGISTRY_PORT", default_value_t = 8968)]
    pub(crate) port: u16,

    /// Storage backend type
    #[arg(short, long, env = "STORAGE_DRIVER", default_value = "FILESYSTEM")]
    pub(crate) storage: String,

    /// Registry root path (`storage.driver` params: filesystem root)
    #[arg(long, env = "REGISTRY_ROOT", default_value = "/var/lib/oci-registry")]
    pub(crate) root: String,

    /// Public base URL this registry is reachable at (used as the
    /// token-auth realm and as the OAuth callback origin)
    #[arg(long, env = "REGISTRY_URL", default_value = "http://127.0.0.1:8968")]
    pub(crate) registry_url: String,

    /// SQLite connection string for the repository/user catalog
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://registry.db")]
    pub(crate) db_url: String,

    /// Salt mixed into password hashing in addition to each user's own salt
    #[arg(long, env = "PASSWORD_SALT", default_value = "")]
    pub(crate) password_salt: String,

    /// Secret used to sign and verify issued bearer JWTs
    #[arg(long, env = "JWT_SECRET", default_value = "change-me")]
    pub(crate) jwt_secret: String,

    /// Lifetime of an issued bearer JWT, in seconds
    #[arg(long, env = "JWT_LIFETIME_SECONDS", default_value_t = 3600)]
    pub(crate) jwt_lifetime_secs: i64,

    /// GitHub OAuth application client ID, for the `/api/v1/auth/github/*` routes
    #[arg(long, env = "GITHUB_CLIENT_ID")]
    pub(crate) github_client_id: Option<String>,

    /// GitHub OAuth application client secret
    #[arg(long, env = "GITHUB_CLIENT_SECRET")]
    pub(crate) github_client_secret: Option<String>,

    /// `proxy.remote-url`: upstream registry to pull through. Omit to run
    /// as a plain (non-caching) registry.
    #[arg(long, env = "PROXY_REMOTE_URL")]
    pub(crate) proxy_remote_url: Option<String>,

    /// `proxy.username`: basic-auth username for the upstream registry
    #[arg(long, env = "PROXY_USERNAME")]
    pub(crate) proxy_username: Option<String>,

    /// `proxy.password`: basic-auth password for the upstream registry
    #[arg(long, env = "PROXY_PASSWORD")]
    pub(crate) proxy_password: Option<String>,

    /// `proxy.ttl.blob`, in seconds (default 168h)
    #[arg(long, env = "PROXY_TTL_BLOB_SECS", default_value_t = 168 * 3600)]
    pub(crate) proxy_ttl_blob_secs: u64,

    /// `proxy.ttl.manifest`, in seconds (default 168h)
    #[arg(long, env = "PROXY_TTL_MANIFEST_SECS", default_value_t = 168 * 3600)]
    pub(crate) proxy_ttl_manifest_secs: u64,

    /// `scheduler.state-path`: driver path of the scheduler state file,
    /// overriding the default `_state/scheduler.json`
    #[arg(long, env = "SCHEDULER_STATE_PATH")]
    pub(crate) scheduler_state_path: Option<String>,

    /// `upload.stale-cutoff`, in seconds (default 7 days)
    #[arg(long, env = "UPLOAD_STALE_CUTOFF_SECS", default_value_t = 7 * 24 * 3600)]
    pub(crate) upload_stale_cutoff_secs: u64,

    /// `auth.trusted-issuers`: comma-separated list, recorded informationally
    #[arg(long, env = "AUTH_TRUSTED_ISSUERS")]
    pub(crate) auth_trusted_issuers: Option<String>,

    /// `auth.accepted-audiences`: comma-separated list, recorded informationally
    #[arg(long, env = "AUTH_ACCEPTED_AUDIENCES")]
    pub(crate) auth_accepted_audiences: Option<String>,

    /// `auth.trusted-keys`: comma-separated list of HMAC secrets accepted
    /// when verifying a manifest's detached signature set
    #[arg(long, env = "AUTH_TRUSTED_KEYS")]
    pub(crate) auth_trusted_keys: Option<String>,

    /// `manifest.require-signatures`: reject `put-manifest` unless every
    /// published manifest carries a signature set verifiable against
    /// `auth.trusted-keys` (spec §4.D `MANIFEST_UNVERIFIED`)
    #[arg(long, env = "MANIFEST_REQUIRE_SIGNATURES", default_value_t = false)]
    pub(crate) manifest_require_signatures: bool,

    /// `proxy.min-throughput-bytes-per-sec`: the assumed minimum upstream
    /// throughput used to size the per-remote-fetch deadline (spec §5: "2x
    /// the expected blob size at a configured minimum throughput")
    #[arg(long, env = "PROXY_MIN_THROUGHPUT_BPS", default_value_t = 1_000_000)]
    pub(crate) proxy_min_throughput_bps: u64,

    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Run the HTTP server (default when no subcommand is given)
    Serve,
    /// Walk every repository/tag once, emitting records into the catalog,
    /// resuming from the last persisted marker
    Migrate {
        /// Start from the beginning instead of the persisted resume marker
        #[arg(long)]
        from_scratch: bool,
    },
    /// Delete upload sessions whose `started-at` predates `upload.stale-cutoff`
    PurgeUploads,
}
