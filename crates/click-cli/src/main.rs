use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};

mod completion;
mod dispatch;
mod logging;
mod render;


#[derive(Parser, Debug)]
#[command(name = "click")]
#[command(about = "Install and register click packages", long_about = None)]
struct Cli {
    /// Read configuration from PATH instead of /etc/click/click.toml.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Look for additional packages in PATH.
    #[arg(long, global = true, value_name = "PATH")]
    root: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default, Clone)]
struct UserTarget {
    /// Act for USER (default: current user).
    #[arg(long, value_name = "USER", conflicts_with = "all_users")]
    user: Option<String>,
    /// Act for every user.
    #[arg(long)]
    all_users: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a package archive.
    Install {
        archive: PathBuf,
        #[command(flatten)]
        target: UserTarget,
        #[arg(long)]
        force_missing_framework: bool,
    },
    /// Register an installed package version for a user.
    Register {
        package: String,
        version: String,
        #[command(flatten)]
        target: UserTarget,
    },
    /// Unregister a package for a user and remove it if nobody else uses it.
    Unregister {
        package: String,
        version: Option<String>,
        #[command(flatten)]
        target: UserTarget,
    },
    /// List installed packages.
    List {
        /// List every unpacked version instead of the user's registrations.
        #[arg(long)]
        all: bool,
        #[arg(long, value_name = "USER")]
        user: Option<String>,
        /// Print manifests as JSON.
        #[arg(long)]
        manifest: bool,
    },
    /// Show the manifest of a registered package or a package archive.
    Info {
        package: String,
        #[arg(long, value_name = "USER")]
        user: Option<String>,
    },
    /// Print the directory of a registered package.
    Pkgdir {
        package: String,
        #[arg(long, value_name = "USER")]
        user: Option<String>,
    },
    /// Remove unregistered package versions.
    Gc,
    #[command(subcommand)]
    Hook(HookCommands),
    /// List frameworks available on this system.
    ListFrameworks,
    /// Generate shell completions.
    Completions { shell: CliCompletionShell },
}

#[derive(Subcommand, Debug)]
enum HookCommands {
    /// Install a hook for every relevant package.
    Install {
        name: String,
        #[arg(long, value_name = "USER")]
        user: Option<String>,
    },
    /// Remove a hook from every relevant package.
    Remove {
        name: String,
        #[arg(long, value_name = "USER")]
        user: Option<String>,
    },
    /// Sync every system-level hook.
    RunSystem,
    /// Sync every user-level hook.
    RunUser {
        #[arg(long, value_name = "USER")]
        user: Option<String>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match dispatch::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
