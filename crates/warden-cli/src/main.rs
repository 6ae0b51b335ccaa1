//! warden daemon front-end.
//!
//! A thin wrapper over the `warden` library: compiles profiles and runs
//! the supervisor socket with a static instance configuration. The real
//! container lifecycle layer embeds the library directly and supplies its
//! own instance lookup; this binary exists for standalone operation and
//! debugging, and is what the forksyscall bridge re-executes.

mod cli;
mod local;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use warden::{policy, RuntimeFeatures, Server};

use crate::cli::{Cli, Commands, ListenArgs, ProfileArgs};
use crate::local::LocalInstance;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Profile(args) => run_profile(args),
        Commands::Listen(args) => run_listen(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(err = %err, "warden failed");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn features_for_profile(args: &ProfileArgs) -> RuntimeFeatures {
    RuntimeFeatures {
        seccomp_listener: true,
        seccomp_listener_continue: true,
        seccomp_listener_addfd: true,
        allow_deny_syntax: !args.legacy_spelling,
        pidfds: true,
        pidfds_thread: false,
    }
}

fn run_profile(args: ProfileArgs) -> Result<(), Box<dyn std::error::Error>> {
    let features = features_for_profile(&args);
    let instance = LocalInstance::from_args(
        &args.name,
        &args.project,
        &args.arch,
        args.privileged,
        &args.config,
    )?;

    match &args.state_dir {
        Some(state_dir) => {
            policy::write_profile(state_dir, &features, &instance)?;
            println!(
                "{}",
                policy::profile_path(state_dir, &instance).display()
            );
        }
        None => {
            print!("{}", policy::policy_content(&features, &instance)?);
        }
    }

    Ok(())
}

fn run_listen(args: ListenArgs) -> Result<(), Box<dyn std::error::Error>> {
    let features = RuntimeFeatures {
        seccomp_listener: true,
        seccomp_listener_continue: !args.no_continue,
        seccomp_listener_addfd: !args.no_addfd,
        allow_deny_syntax: true,
        pidfds: !args.no_pidfds,
        pidfds_thread: false,
    };

    // Standalone mode serves one static configuration for any connecting
    // monitor; embedding runtimes resolve real instances instead.
    let instance: Arc<dyn warden::Instance> = Arc::new(LocalInstance::from_args(
        "standalone",
        "default",
        "x86_64",
        false,
        &args.config,
    )?);

    if let Some(dir) = args.socket.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let server = Server::bind(
        &args.socket,
        features,
        std::env::current_exe().unwrap_or_else(|_| {
            std::env::args_os()
                .next()
                .map(Into::into)
                .unwrap_or_default()
        }),
        Box::new(move |_monitor_pid| Ok(Arc::clone(&instance))),
    )?;

    server.run()?;
    Ok(())
}
