use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_DATABASE", default_value = "postgres")]
    pub postgres_database: String,

    #[arg(long, env = "POSTGRES_USERNAME", default_value = "postgres")]
    pub postgres_username: String,

    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,

    #[arg(long, env = "POSTGRES_CA_CERT")]
    pub postgres_ca_cert: Option<String>,

    #[arg(long, env = "POSTGRES_SSL_MODE", default_value = "prefer")]
    pub postgres_ssl_mode: String,
}

/// Optional JWT/JWKS auth for the public HTTP surface. When `endpoint`
/// is unset, the public surface runs unauthenticated.
#[derive(Parser, Debug, Clone)]
pub struct SecurityArgs {
    #[arg(long, env = "SECURITY_JWKS_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, env = "SECURITY_REALM")]
    pub realm: Option<String>,

    #[arg(long, env = "SECURITY_CLIENT_ID")]
    pub client_id: Option<String>,
}

/// Bounds on the soft-deletion grace period a delete request may request.
#[derive(Parser, Debug, Clone)]
pub struct DeletionArgs {
    #[arg(long, env = "DELETION_DEFAULT_EXPIRY_MS", default_value_t = 3_600_000)]
    pub default_expiry_ms: i64,

    #[arg(long, env = "DELETION_MAX_EXPIRY_MS", default_value_t = 30 * 24 * 3_600_000)]
    pub max_expiry_ms: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct SupervisorArgs {
    /// How often each resource-type worker polls for pending work.
    #[arg(long, env = "SUPERVISOR_TICK_MS", default_value_t = 5_000)]
    pub tick_ms: u64,

    /// Maximum number of rows a single tick will attempt to drive.
    #[arg(long, env = "SUPERVISOR_BATCH_SIZE", default_value_t = 50)]
    pub batch_size: i64,

    /// Per-action provisioner call timeout.
    #[arg(long, env = "SUPERVISOR_ACTION_TIMEOUT_MS", default_value_t = 30_000)]
    pub action_timeout_ms: u64,
}
