//! docsync CLI
//!
//! Command-line tools for serving and replicating docsync databases.
//!
//! # Commands
//!
//! - `listen` - Serve a database to remote replicators
//! - `replicate` - Replicate a database with a remote listener
//! - `identity` - Manage TLS identities (create, import, export, delete, list)

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docsync command-line tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Replication direction accepted on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Direction {
    /// Send local changes only
    Push,
    /// Receive remote changes only
    Pull,
    /// Both directions
    PushAndPull,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the database to remote replicators until interrupted
    Listen {
        /// Port to listen on (ephemeral if omitted)
        #[arg(long)]
        port: Option<u16>,

        /// Address of the interface to bind (all interfaces if omitted)
        #[arg(long)]
        interface: Option<String>,

        /// Serve plain TCP instead of TLS
        #[arg(long)]
        no_tls: bool,

        /// Identity store directory (server identity and anonymous identities)
        #[arg(long)]
        identities: Option<PathBuf>,

        /// Label of the server identity in the identity store
        #[arg(long, requires = "identities")]
        identity: Option<String>,

        /// Require this username (with --password)
        #[arg(long, requires = "password")]
        username: Option<String>,

        /// Password for --username
        #[arg(long, requires = "username")]
        password: Option<String>,

        /// Reject pushes
        #[arg(long)]
        read_only: bool,

        /// Advertise delta sync
        #[arg(long)]
        delta_sync: bool,
    },

    /// Replicate with a listener at ws[s]://host:port/database
    Replicate {
        /// Listener URL
        url: String,

        /// Direction
        #[arg(short = 't', long = "type", value_enum, default_value = "push-and-pull")]
        direction: Direction,

        /// Keep replicating until interrupted
        #[arg(short, long)]
        continuous: bool,

        /// Username for Basic authentication
        #[arg(long, requires = "password")]
        username: Option<String>,

        /// Password for Basic authentication
        #[arg(long, requires = "username")]
        password: Option<String>,

        /// PEM file with the exact server certificate to trust
        #[arg(long)]
        pin: Option<PathBuf>,

        /// Trust any self-signed server certificate
        #[arg(long)]
        self_signed: bool,

        /// Identity store directory holding the client certificate
        #[arg(long, requires = "client_identity")]
        identities: Option<PathBuf>,

        /// Label of the client identity to present
        #[arg(long, requires = "identities")]
        client_identity: Option<String>,

        /// Forget the checkpoint and consider every document again
        #[arg(long)]
        reset: bool,
    },

    /// Manage TLS identities
    Identity {
        /// Identity store directory
        #[arg(short, long)]
        store: PathBuf,

        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate a self-signed identity
    Create {
        /// Label to store the identity under
        label: String,

        /// Common name of the certificate
        #[arg(long)]
        common_name: String,

        /// Create a client identity instead of a server identity
        #[arg(long)]
        client: bool,

        /// Organization
        #[arg(long)]
        organization: Option<String>,

        /// Days until the certificate expires
        #[arg(long)]
        days: Option<i64>,
    },

    /// Import a PEM file or password-protected bundle
    Import {
        /// File to import
        file: PathBuf,

        /// Label to store the identity under
        #[arg(long)]
        label: String,

        /// Bundle password
        #[arg(long)]
        password: Option<String>,
    },

    /// Export an identity as a password-protected bundle
    Export {
        /// Label of the identity
        label: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Bundle password
        #[arg(long)]
        password: String,
    },

    /// Delete an identity (no error if missing)
    Delete {
        /// Label of the identity
        label: String,
    },

    /// List stored identities
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete auto-generated listener identities
    PurgeAnonymous,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Listen {
            port,
            interface,
            no_tls,
            identities,
            identity,
            username,
            password,
            read_only,
            delta_sync,
        } => {
            let path = cli.path.ok_or("Database path required for listen")?;
            let options = commands::listen::ListenOptions {
                port,
                interface,
                tls: !no_tls,
                identities,
                identity,
                credentials: username.zip(password),
                read_only,
                delta_sync,
            };
            commands::listen::run(&path, options).await?;
        }
        Commands::Replicate {
            url,
            direction,
            continuous,
            username,
            password,
            pin,
            self_signed,
            identities,
            client_identity,
            reset,
        } => {
            let path = cli.path.ok_or("Database path required for replicate")?;
            let options = commands::replicate::ReplicateOptions {
                url,
                direction,
                continuous,
                credentials: username.zip(password),
                pin,
                self_signed,
                client_identity: identities.zip(client_identity),
                reset,
            };
            commands::replicate::run(&path, options).await?;
        }
        Commands::Identity { store, action } => match action {
            IdentityAction::Create {
                label,
                common_name,
                client,
                organization,
                days,
            } => commands::identity::create(&store, &label, &common_name, client, organization, days)?,
            IdentityAction::Import {
                file,
                label,
                password,
            } => commands::identity::import(&store, &file, &label, password.as_deref())?,
            IdentityAction::Export {
                label,
                output,
                password,
            } => commands::identity::export(&store, &label, &output, &password)?,
            IdentityAction::Delete { label } => commands::identity::delete(&store, &label)?,
            IdentityAction::List { format } => commands::identity::list(&store, &format)?,
            IdentityAction::PurgeAnonymous => commands::identity::purge_anonymous(&store)?,
        },
        Commands::Version => {
            println!("docsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
