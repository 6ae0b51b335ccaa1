//! CLI argument definitions for warden
//!
//! Uses clap for argument parsing. This module defines all subcommands
//! and their options.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// warden - seccomp syscall supervision for unprivileged containers
///
/// Compiles seccomp policies for a container runtime and supervises the
/// resulting user notifications, emulating the intercepted syscalls on
/// the container's behalf.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile the seccomp profile for an instance configuration
    #[command(after_help = "EXAMPLES:
    # Print the default profile
    warden profile --name c1

    # Enable mknod and sysinfo interception
    warden profile --name c1 \\
        --config security.syscalls.intercept.mknod=true \\
        --config security.syscalls.intercept.sysinfo=true

    # Write the profile under a state directory instead of printing it
    warden profile --name c1 --state-dir /var/lib/warden
")]
    Profile(ProfileArgs),

    /// Run the supervisor socket and handle notifications
    #[command(after_help = "EXAMPLES:
    # Listen with full runtime capabilities assumed
    warden listen --socket /run/warden/seccomp.socket

    # Restrict to a runtime without addfd support
    warden listen --socket /run/warden/seccomp.socket --no-addfd
")]
    Listen(ListenArgs),
}

#[derive(clap::Args, Debug)]
pub struct ProfileArgs {
    /// Instance name
    #[arg(long)]
    pub name: String,

    /// Project the instance belongs to
    #[arg(long, default_value = "default")]
    pub project: String,

    /// Instance architecture
    #[arg(long, default_value = "x86_64")]
    pub arch: String,

    /// Treat the instance as privileged (no interception)
    #[arg(long)]
    pub privileged: bool,

    /// Configuration entries, key=value, repeatable
    #[arg(long = "config", value_name = "KEY=VALUE")]
    pub config: Vec<String>,

    /// Write the profile below this directory instead of printing it
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Assume the runtime only understands the legacy
    /// whitelist/blacklist spelling
    #[arg(long)]
    pub legacy_spelling: bool,
}

#[derive(clap::Args, Debug)]
pub struct ListenArgs {
    /// Path of the supervisor socket
    #[arg(long, default_value = "/run/warden/seccomp.socket")]
    pub socket: PathBuf,

    /// Configuration entries applied to every connection, key=value
    #[arg(long = "config", value_name = "KEY=VALUE")]
    pub config: Vec<String>,

    /// Runtime cannot continue intercepted syscalls
    #[arg(long)]
    pub no_continue: bool,

    /// Runtime cannot inject file descriptors
    #[arg(long)]
    pub no_addfd: bool,

    /// Host has no pidfd support
    #[arg(long)]
    pub no_pidfds: bool,
}

/// Parse repeated `key=value` config flags.
pub fn parse_config_pairs(pairs: &[String]) -> Result<Vec<(String, String)>, String> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("Invalid config entry (want key=value): {pair}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_pairs() {
        let pairs = parse_config_pairs(&[
            "security.syscalls.intercept.mknod=true".to_string(),
            "raw.seccomp=".to_string(),
        ])
        .unwrap();
        assert_eq!(
            pairs[0],
            (
                "security.syscalls.intercept.mknod".to_string(),
                "true".to_string()
            )
        );
        assert_eq!(pairs[1].1, "");
    }

    #[test]
    fn test_parse_config_pairs_rejects_bare_keys() {
        assert!(parse_config_pairs(&["not-a-pair".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_profile_command() {
        let cli = Cli::try_parse_from([
            "warden",
            "profile",
            "--name",
            "c1",
            "--config",
            "security.syscalls.intercept.sysinfo=true",
        ])
        .unwrap();

        match cli.command {
            Commands::Profile(args) => {
                assert_eq!(args.name, "c1");
                assert_eq!(args.project, "default");
                assert_eq!(args.config.len(), 1);
            }
            _ => panic!("expected profile command"),
        }
    }

    #[test]
    fn test_cli_parses_listen_command() {
        let cli = Cli::try_parse_from(["warden", "listen", "--no-addfd"]).unwrap();
        match cli.command {
            Commands::Listen(args) => {
                assert!(args.no_addfd);
                assert!(!args.no_continue);
            }
            _ => panic!("expected listen command"),
        }
    }
}
