use clap::{Args, Parser, Subcommand};
use std::fmt;
use std::path::PathBuf;

use ddcache_core::config::{DEFAULT_CLIENT_NAME, DEFAULT_ORG_ID, DEFAULT_RETRY_ATTEMPTS};

#[derive(Parser)]
#[command(name = "ddcache")]
#[command(about = "Save and restore build caches against a remote key/value cache")]
#[command(after_help = "Run '<command> --help' for detailed options on each command.")]
pub struct Cli {
    /// Log debug output from the transfer engine
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload the cache archive and its metadata for a branch
    Save(SaveArgs),
    /// Download and unpack the cache archive and its metadata for a branch
    Restore(RestoreArgs),
}

/// Flags every command needs to reach the cache.
#[derive(Args, Clone)]
pub struct RemoteArgs {
    /// Cache service URL (grpc://host:port or grpcs://host:port)
    #[arg(long, visible_alias = "service-url", visible_alias = "upload-url")]
    pub cache_url: String,
    /// Bearer token for the cache service
    #[arg(long, env = "DDCACHE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: String,
    /// Branch the cache entries are keyed by
    #[arg(long)]
    pub branch: String,
    /// Namespace prepended to every key
    #[arg(long, default_value = DEFAULT_CLIENT_NAME)]
    pub client_name: String,
    /// Organization id sent with every request
    #[arg(long, default_value = DEFAULT_ORG_ID)]
    pub org_id: String,
    /// Total upload attempts, including the first
    #[arg(long, default_value_t = DEFAULT_RETRY_ATTEMPTS)]
    pub retries: u32,
}

impl fmt::Debug for RemoteArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteArgs")
            .field("cache_url", &self.cache_url)
            .field("access_token", &"<redacted>")
            .field("branch", &self.branch)
            .field("client_name", &self.client_name)
            .field("org_id", &self.org_id)
            .field("retries", &self.retries)
            .finish()
    }
}

#[derive(Args, Clone, Debug)]
pub struct SaveArgs {
    /// Archive to upload; with --compress, the spill file the archive is written to
    #[arg(long)]
    pub cache_archive: PathBuf,
    /// Metadata file to upload after the archive
    #[arg(long)]
    pub cache_metadata: PathBuf,
    /// Paths to archive and compress while uploading
    #[arg(long, num_args = 1.., value_name = "PATH")]
    pub compress: Vec<PathBuf>,
    #[command(flatten)]
    pub remote: RemoteArgs,
}

#[derive(Args, Clone, Debug)]
pub struct RestoreArgs {
    /// Where to write the downloaded metadata
    #[arg(long)]
    pub cache_metadata: PathBuf,
    /// Save the raw archive here instead of unpacking it
    #[arg(long)]
    pub cache_archive: Option<PathBuf>,
    #[command(flatten)]
    pub remote: RemoteArgs,
}
