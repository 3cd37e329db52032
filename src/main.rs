use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Commands, IsoCommands, McpCommands, VmCommands};
use vmhub::config::{self, VmHubConfig};
use vmhub::handlers::{error_json, CommandHandler, CreateRequest};
use vmhub::mcp::McpServer;
use vmhub::vm::process::SystemRunner;
use vmhub::vm::{Owner, SshOptions, SshOutcome, VmError};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "vmhub")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.vmhub/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root directory holding one directory per VM
    #[arg(long, global = true)]
    vm_dir: Option<PathBuf>,

    /// Print structured JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

/// What a command produced, once printed.
enum Outcome {
    Done,
    /// Exit with the remote command's status.
    Remote(Option<i32>),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for --json and JSON-RPC.
    let default_filter = if cli.verbose { "vmhub=debug" } else { "vmhub=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!("vmhub v{} starting", env!("CARGO_PKG_VERSION"));

    let json = cli.json;
    match run(cli).await {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::Remote(code)) => ExitCode::from(code.unwrap_or(1).clamp(0, 255) as u8),
        Err(e) => match e.downcast_ref::<VmError>() {
            Some(vm_err) => {
                report_error(vm_err, json);
                ExitCode::from(vm_err.kind().exit_code().clamp(0, 255) as u8)
            }
            None => {
                eprintln!("{} {:#}", style("✗").red(), e);
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    let mut settings: VmHubConfig = config::load_config(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::Mcp {
            command: McpCommands::Serve,
        } => {
            let handler = CommandHandler::from_config(&settings, cli.vm_dir, Arc::new(SystemRunner::new()))?;
            let server = McpServer::new(Arc::new(handler));
            server.serve_stdio().await.context("MCP server I/O failed")?;
            Ok(Outcome::Done)
        }
        Commands::Vm { command } => {
            match &command {
                VmCommands::Start { timeout: Some(secs), .. } | VmCommands::Ssh { timeout: Some(secs), .. } => {
                    settings.ssh.wait_timeout_secs = *secs;
                }
                _ => {}
            }
            let handler = CommandHandler::from_config(&settings, cli.vm_dir, Arc::new(SystemRunner::new()))?;
            info!("VM directory: {}", handler.manager().vm_root().display());
            run_vm(&handler, command, json, settings.ssh_wait_timeout()).await
        }
    }
}

async fn run_vm(handler: &CommandHandler, command: VmCommands, json: bool, ssh_wait: Duration) -> Result<Outcome> {
    match command {
        VmCommands::List => {
            let vms = handler.list().await?;
            if json {
                cli::print_json(&vms);
            } else {
                cli::print_vm_table(&vms);
            }
        }
        VmCommands::Create {
            name,
            os_type,
            template,
            iso,
            ram,
            disk_size,
            cpus,
            network,
            bridge,
            forwards,
            ssh_key,
            no_ssh,
            post_create,
        } => {
            let request = CreateRequest {
                name: name.clone(),
                os_type,
                template,
                iso,
                ram,
                cpus,
                disk_size,
                network,
                bridge,
                forwards,
                ssh_key,
                no_ssh,
                post_create,
            };
            let spinner = spinner(json, format!("Creating {name}"));
            let result = handler.create(request).await;
            finish(spinner);
            let backend = result?;
            done(json, serde_json::json!({ "name": name, "backend": backend }), || {
                format!("Created {name} on {backend}")
            });
        }
        VmCommands::Start { name, wait_ssh, .. } => {
            let label = if wait_ssh {
                format!("Starting {name} and waiting for SSH")
            } else {
                format!("Starting {name}")
            };
            let spinner = spinner(json, label);
            let result = handler.start(&name, wait_ssh).await;
            finish(spinner);
            let backend = result?;
            done(json, serde_json::json!({ "name": name, "backend": backend }), || {
                format!("Started {name} ({backend})")
            });
        }
        VmCommands::Stop { name, force } => {
            let backend = handler.stop(&name, force).await?;
            done(json, serde_json::json!({ "name": name, "backend": backend }), || {
                format!("Stopped {name} ({backend})")
            });
        }
        VmCommands::Restart { name } => {
            let backend = handler.restart(&name).await?;
            done(json, serde_json::json!({ "name": name, "backend": backend }), || {
                format!("Restarted {name} ({backend})")
            });
        }
        VmCommands::Suspend { name } => {
            let backend = handler.suspend(&name).await?;
            done(json, serde_json::json!({ "name": name, "backend": backend }), || {
                format!("Suspended {name} ({backend})")
            });
        }
        VmCommands::Resume { name } => {
            let backend = handler.resume(&name).await?;
            done(json, serde_json::json!({ "name": name, "backend": backend }), || {
                format!("Resumed {name} ({backend})")
            });
        }
        VmCommands::Delete { name, keep_disk } => {
            let owner = handler.delete(&name, keep_disk).await?;
            let backend = match owner {
                Owner::Backend(kind) => kind.to_string(),
                Owner::Filesystem => "filesystem".to_string(),
            };
            done(
                json,
                serde_json::json!({ "name": name, "backend": backend, "keep_disk": keep_disk }),
                || {
                    if keep_disk {
                        format!("Deleted {name} ({backend}); disk kept")
                    } else {
                        format!("Deleted {name} ({backend})")
                    }
                },
            );
        }
        VmCommands::Info { name } => {
            let vm = handler.info(&name).await?;
            if json {
                cli::print_json(&vm);
            } else {
                cli::print_vm_info(&vm);
            }
        }
        VmCommands::State { name } => {
            let state = handler.state(&name).await?;
            if json {
                cli::print_json(&serde_json::json!({ "name": name, "state": state }));
            } else {
                println!("{state}");
            }
        }
        VmCommands::Snapshot {
            name,
            action,
            snapshot,
            description,
        } => {
            let result = handler
                .snapshot(&name, action, snapshot.as_deref(), description)
                .await?;
            if json {
                cli::print_json(&result);
            } else {
                cli::print_snapshot_result(&result);
            }
        }
        VmCommands::Ssh {
            name,
            command,
            user,
            no_wait,
            auto_start,
            check,
            ..
        } => {
            let opts = SshOptions {
                command,
                wait_timeout: ssh_wait,
                no_wait,
                auto_start,
                check_only: check,
                user,
            };
            let outcome = handler.ssh(&name, &opts).await?;
            if json {
                cli::print_json(&outcome);
            }
            return Ok(match outcome {
                SshOutcome::Check { ready, endpoint } => {
                    if !json {
                        match (ready, endpoint) {
                            (true, Some(ep)) => println!("SSH is ready on {name} ({ep})"),
                            _ => println!("SSH is not ready on {name}"),
                        }
                    }
                    if ready {
                        Outcome::Done
                    } else {
                        Outcome::Remote(Some(1))
                    }
                }
                SshOutcome::Command {
                    exit_code,
                    stdout,
                    stderr,
                    ..
                } => {
                    if !json {
                        print!("{stdout}");
                        eprint!("{stderr}");
                    }
                    Outcome::Remote(exit_code)
                }
                SshOutcome::Session { exit_code, .. } => Outcome::Remote(exit_code),
            });
        }
        VmCommands::Copy {
            name,
            src,
            dst,
            from_vm,
            user,
        } => {
            handler.copy(&name, &src, &dst, from_vm, user.as_deref()).await?;
            done(json, serde_json::json!({ "name": name, "src": src, "dst": dst }), || {
                format!("Copied {src} -> {dst}")
            });
        }
        VmCommands::Backends { versions } => {
            let report = handler.backends(versions).await?;
            if json {
                cli::print_json(&report);
            } else {
                cli::print_backends(&report);
            }
        }
        VmCommands::Templates => {
            let templates = handler.templates()?;
            if json {
                cli::print_json(&templates);
            } else {
                cli::print_templates(templates);
            }
        }
        VmCommands::Check { versions } => {
            let report = handler.check_host(versions).await?;
            if json {
                cli::print_json(&report);
            } else {
                cli::print_host(&report);
            }
        }
        VmCommands::Iso { command } => match command {
            IsoCommands::List => {
                let entries = handler.iso_list()?;
                if json {
                    cli::print_json(&entries);
                } else {
                    cli::print_isos(&entries);
                }
            }
            IsoCommands::Verify { target, sha } => {
                let verification = handler.iso_verify(&target, sha.as_deref()).await?;
                if json {
                    cli::print_json(&verification);
                } else {
                    cli::print_verification(&verification);
                }
            }
        },
    }
    Ok(Outcome::Done)
}

fn done(json: bool, value: serde_json::Value, message: impl FnOnce() -> String) {
    if json {
        let mut value = value;
        value["success"] = serde_json::json!(true);
        cli::print_json(&value);
    } else {
        println!("{} {}", style("✓").green(), message());
    }
}

fn report_error(error: &VmError, json: bool) {
    if json {
        cli::print_json(&serde_json::json!({ "success": false, "error": error_json(error) }));
        return;
    }
    eprintln!("{} {} ({})", style("✗").red(), error, error.kind());
    for attempt in error.attempts() {
        eprintln!("  - {}: {}", attempt.backend, attempt.reason);
    }
}

fn spinner(json: bool, message: String) -> Option<ProgressBar> {
    if json || !console::Term::stderr().is_term() {
        info!("{}", message);
        return None;
    }
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]") {
        bar.set_style(style);
    }
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(120));
    Some(bar)
}

fn finish(spinner: Option<ProgressBar>) {
    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }
}
