use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Local key file (overrides CREDENTIAL_GUARD_KEY_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub key_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Encrypt a secret with the local key
    Encrypt {
        /// Plaintext; read from stdin when omitted
        text: Option<String>,
    },

    /// Decrypt a blob produced by `encrypt`
    Decrypt {
        /// Base64 blob; read from stdin when omitted
        blob: Option<String>,
    },

    /// Generate proof-of-possession key material in account-store format
    Keygen,

    /// Query the moderation status of a credential
    Check {
        #[arg(long, env = "CREDENTIAL_GUARD_COOKIE", hide_env_values = true)]
        cookie: String,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build a secure auth intent (fetches a server nonce)
    Intent {
        #[arg(long, env = "CREDENTIAL_GUARD_COOKIE", hide_env_values = true)]
        cookie: String,
    },

    /// Build a bound auth token over a request body
    BoundToken {
        #[arg(long, env = "CREDENTIAL_GUARD_COOKIE", hide_env_values = true)]
        cookie: String,

        /// Target URL of the request
        #[arg(long)]
        url: String,

        /// Request body; read from stdin when omitted
        #[arg(long)]
        body: Option<String>,
    },
}
