//! Command-line interface: the trigger server plus a small sandbox console.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::{Config, SandboxBackend};
use crate::orchestrator::{Dispatcher, EntrypointApi, ExecutionContext, Provisioner};
use crate::sandbox::{self, CommandRequest, SandboxHandle, SandboxId, SandboxSpec};
use crate::worker::job_from_config;

#[derive(Parser, Debug)]
#[command(name = "sandcron")]
#[command(about = "Run scheduled jobs inside a freshly provisioned sandbox")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the trigger endpoint (default)
    Serve,

    /// Inspect and manage sandboxes directly
    Sandbox {
        #[command(subcommand)]
        action: SandboxCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum SandboxCommand {
    /// Provision a sandbox from the configured source and print its id
    Create,

    /// Show a sandbox's status and routes
    Status { id: String },

    /// Stop a sandbox if it is still pending or running
    Stop { id: String },

    /// Run a command inside a sandbox, streaming its output
    Exec {
        id: String,

        /// Run with elevated privileges
        #[arg(long)]
        sudo: bool,

        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
}

/// Run the trigger endpoint until the process is stopped.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    config.auth.require_secret()?;
    if config.context == ExecutionContext::Outer && config.platform.backend == SandboxBackend::Rest {
        config.platform.require_token()?;
    }

    let platform = sandbox::connect(&config.platform)?;
    // Validated on both sides: the outer env is forwarded into the sandbox.
    let job = job_from_config(&config.job)?;
    let dispatcher = Arc::new(Dispatcher::from_config(&config, platform, job)?);

    tracing::info!(
        context = ?config.context,
        backend = %config.platform.backend,
        "Starting sandcron"
    );
    EntrypointApi::start(dispatcher, config.server.addr())
        .await
        .map_err(|e| anyhow::anyhow!("trigger server failed: {}", e))
}

/// Execute one sandbox console command. Returns the process exit code.
pub async fn run_sandbox(config: &Config, action: SandboxCommand) -> anyhow::Result<i32> {
    let platform = sandbox::connect(&config.platform)?;

    match action {
        SandboxCommand::Create => {
            let spec = SandboxSpec::from_config(&config.sandbox)?;
            let provisioner = Provisioner::new(platform, Some(spec));
            let handle = provisioner.create().await?;
            print_handle(&handle);
            Ok(0)
        }
        SandboxCommand::Status { id } => {
            let handle = platform
                .get(&SandboxId::new(id))
                .await
                .context("failed to look up sandbox")?;
            print_handle(&handle);
            Ok(0)
        }
        SandboxCommand::Stop { id } => {
            let handle = platform
                .get(&SandboxId::new(id))
                .await
                .context("failed to look up sandbox")?;
            if !handle.status.can_stop() {
                println!("Sandbox {} is {}, nothing to stop", handle.id, handle.status);
                return Ok(0);
            }
            platform
                .stop(&handle)
                .await
                .context("failed to stop sandbox")?;
            println!("Stopping sandbox {}", handle.id);
            Ok(0)
        }
        SandboxCommand::Exec { id, sudo, command } => {
            let handle = platform
                .get(&SandboxId::new(id))
                .await
                .context("failed to look up sandbox")?;
            let Some((cmd, args)) = command.split_first() else {
                anyhow::bail!("no command given");
            };
            let request = CommandRequest::new(cmd.clone())
                .args(args.iter().cloned())
                .sudo(sudo);
            let outcome = platform
                .run_command(&handle, &request)
                .await
                .context("failed to run command")?;
            let code = outcome.exit_code.unwrap_or(0);
            Ok(i32::try_from(code).unwrap_or(1))
        }
    }
}

fn print_handle(handle: &SandboxHandle) {
    println!("{}\t{}", handle.id, handle.status);
    for route in &handle.routes {
        println!("  port {} -> {}", route.port, route.url);
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn serve_is_the_default() {
        let args = Args::try_parse_from(["sandcron"]).unwrap();
        assert!(args.command.is_none());
    }

    #[test]
    fn exec_keeps_trailing_flags() {
        let args =
            Args::try_parse_from(["sandcron", "sandbox", "exec", "sbx_1", "--sudo", "--", "ls", "-la"])
                .unwrap();
        match args.command {
            Some(Command::Sandbox {
                action: SandboxCommand::Exec { id, sudo, command },
            }) => {
                assert_eq!(id, "sbx_1");
                assert!(sudo);
                assert_eq!(command, vec!["ls", "-la"]);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
