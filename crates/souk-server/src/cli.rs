use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "souk-server", about = "Listing conversations server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/souk.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a bearer token for a user, signed with the configured secret.
    /// For local testing without the identity provider.
    Token {
        user_id: i64,
        /// Lifetime in seconds (defaults to auth.jwt_expiry_seconds)
        #[arg(long)]
        expiry: Option<u64>,
    },
}
