//! Sandbox Manager - Entry Point
//!
//! Every command prints its result as JSON on stdout; logs go to stderr.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use miette::{IntoDiagnostic, Result, miette};
use serde::Serialize;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use sandbox_manager::driver::{
    CONTAINER_DRIVER_NAME, ContainerDriver, ContainerDriverConfig, LOCAL_DRIVER_NAME, LocalDriver,
    LocalDriverConfig,
};
use sandbox_manager::helper::{self, supervise};
use sandbox_manager::manager::{FileStore, Manager};
use sandbox_manager::sandbox::{
    Encoding, ExecOptions, ReadDirOptions, ReadOptions, SandboxConfig, WaitOptions, WriteOptions,
    content,
};
use sandbox_manager::system::{self, paths};

/// Sandbox Manager - create, fork and drive isolated sandboxes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory for the index and local sandboxes
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Working directory for new local sandboxes (defaults to a private dir)
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Container engine CLI
    #[arg(long, global = true, default_value = "docker")]
    engine: String,

    /// Base image for new container sandboxes
    #[arg(long, global = true)]
    image: Option<String>,

    /// Driver used when a sandbox record names none
    #[arg(long, global = true, default_value = LOCAL_DRIVER_NAME)]
    default_driver: String,

    /// Helper executable used by the local driver (defaults to this binary)
    #[arg(long, global = true)]
    helper: Option<PathBuf>,

    /// Skip host requirement checks
    #[arg(long, global = true, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a sandbox
    Create {
        id: String,
        /// Driver to use instead of the default
        #[arg(long)]
        driver: Option<String>,
        /// Metadata entry, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },
    /// Create a sandbox as a copy of an existing one
    Fork {
        parent: String,
        /// Id of the new sandbox (generated if omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// Reset a sandbox to a fresh state, keeping its record
    Recreate { id: String },
    /// Delete a sandbox and its record
    Delete { id: String },
    /// List sandbox records
    List,
    /// Start a detached process
    Exec {
        id: String,
        /// Working directory inside the sandbox
        #[arg(long)]
        cwd: Option<String>,
        /// Environment variable, repeatable
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        env: Vec<(String, String)>,
        /// Cap on captured output in bytes (0 = unlimited)
        #[arg(long, default_value = "0")]
        limit: u64,
        /// Wait for completion and print the output
        #[arg(long)]
        wait: bool,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Print captured output of a process
    Output { id: String, process: String },
    /// Wait for a process to exit
    Wait {
        id: String,
        process: String,
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Send a signal to a process
    Kill {
        id: String,
        process: String,
        #[arg(long)]
        signal: Option<String>,
    },
    /// Drop a process record
    Release { id: String, process: String },
    /// Read a file
    Read {
        id: String,
        path: String,
        #[arg(long, default_value = "utf-8")]
        encoding: Encoding,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Write a file, content from --content or stdin
    Write {
        id: String,
        path: String,
        #[arg(long)]
        content: Option<String>,
        #[arg(long, default_value = "utf-8")]
        encoding: Encoding,
    },
    /// Delete a file
    Rm { id: String, path: String },
    /// List a directory
    Ls {
        id: String,
        #[arg(default_value = ".")]
        path: String,
        #[arg(short, long)]
        recursive: bool,
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Host-side helper invoked by the local driver
    #[command(hide = true)]
    Helper {
        #[command(subcommand)]
        command: HelperCommands,
    },
}

#[derive(Subcommand, Debug)]
enum HelperCommands {
    /// Print file content
    Read {
        path: PathBuf,
        #[arg(long, default_value = "utf-8")]
        encoding: Encoding,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Write stdin to a file
    Write {
        path: PathBuf,
        #[arg(long, default_value = "utf-8")]
        encoding: Encoding,
    },
    /// Print listing records
    Readdir {
        path: PathBuf,
        offset: usize,
        limit: Option<usize>,
        #[arg(long)]
        recursive: bool,
    },
    /// Supervise a command
    Exec(ExecArgs),
}

#[derive(ClapArgs, Debug)]
struct ExecArgs {
    /// Process record directory
    #[arg(long)]
    dir: PathBuf,
    /// Output byte limit (0 = unlimited)
    #[arg(long, default_value = "0")]
    limit: u64,
    #[arg(long)]
    cwd: Option<PathBuf>,
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

/// Exit status of `helper read` when the file does not exist.
const HELPER_EXIT_ABSENT: u8 = 3;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // stdout carries command results, so logs always go to stderr
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };
    let is_helper = matches!(args.command, Commands::Helper { .. });

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(!is_helper)
        .init();

    if let Commands::Helper { command } = args.command {
        return run_helper(command).await;
    }

    let base_dir = args.base_dir.clone().unwrap_or_else(paths::default_base_dir);
    let helper_path = match &args.helper {
        Some(path) => path.clone(),
        None => std::env::current_exe().into_diagnostic()?,
    };

    if args.skip_checks {
        warn!("Skipping host requirement checks (--skip-checks)");
    } else {
        let engine = (args.default_driver == CONTAINER_DRIVER_NAME).then_some(args.engine.as_str());
        match system::check_all(&helper_path, &base_dir, engine) {
            Ok(reqs) => debug!(?reqs, "host requirements satisfied"),
            Err(e) => {
                error!("Host requirements check failed");
                return Err(e).into_diagnostic();
            }
        }
    }

    let manager = build_manager(&args, &base_dir, helper_path)?;
    run_command(&manager, args.command).await?;
    Ok(ExitCode::SUCCESS)
}

fn build_manager(args: &Args, base_dir: &std::path::Path, helper_path: PathBuf) -> Result<Manager> {
    let store = FileStore::open(paths::index_dir(base_dir))?;

    let mut local = LocalDriverConfig::new(paths::sandboxes_dir(base_dir)).with_helper_path(helper_path);
    if let Some(workdir) = &args.workdir {
        local = local.with_workdir(workdir);
    }

    let mut container = ContainerDriverConfig::default().with_engine(&args.engine);
    if let Some(image) = &args.image {
        container = container.with_image(image);
    }

    Ok(Manager::new(Arc::new(store))
        .with_driver(Arc::new(LocalDriver::new(local)))
        .with_driver(Arc::new(ContainerDriver::new(container)))
        .with_default_driver(&args.default_driver))
}

async fn run_command(manager: &Manager, command: Commands) -> Result<()> {
    match command {
        Commands::Create { id, driver, meta } => {
            let mut config = SandboxConfig::new(id);
            config.driver_name = driver;
            for (key, value) in meta {
                config = config.with_meta(key, value);
            }
            let sandbox = manager.create_sandbox(config).await?;
            info!(id = sandbox.id(), "sandbox created");
            print_json(&manager.get_config(sandbox.id()).await?)
        }
        Commands::Fork { parent, id } => {
            let sandbox = manager.fork_sandbox(&parent, id).await?;
            print_json(&manager.get_config(sandbox.id()).await?)
        }
        Commands::Recreate { id } => {
            manager.recreate_sandbox(&id).await?;
            print_json(&manager.get_config(&id).await?)
        }
        Commands::Delete { id } => {
            manager.delete_sandbox(&id).await?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
        Commands::List => print_json(&manager.list_sandboxes().await?),
        Commands::Exec {
            id,
            cwd,
            env,
            limit,
            wait,
            command,
        } => {
            let sandbox = manager.load_sandbox(&id).await?;
            let (program, rest) = command
                .split_first()
                .ok_or_else(|| miette!("missing command"))?;

            let mut options = ExecOptions::new().with_output_byte_limit(limit);
            if let Some(cwd) = cwd {
                options = options.with_cwd(cwd);
            }
            for (key, value) in env {
                options = options.with_env(key, value);
            }

            let process_id = sandbox.execute(program, rest, options).await?;
            if wait {
                sandbox.wait(&process_id).await?;
                let output = sandbox.output(&process_id).await?;
                print_json(&serde_json::json!({ "processId": process_id, "result": output }))
            } else {
                print_json(&serde_json::json!({ "processId": process_id }))
            }
        }
        Commands::Output { id, process } => {
            let sandbox = manager.load_sandbox(&id).await?;
            print_json(&sandbox.output(&process).await?)
        }
        Commands::Wait {
            id,
            process,
            timeout,
        } => {
            let sandbox = manager.load_sandbox(&id).await?;
            let mut options = WaitOptions::default();
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            print_json(&sandbox.wait_with(&process, options).await?)
        }
        Commands::Kill {
            id,
            process,
            signal,
        } => {
            let sandbox = manager.load_sandbox(&id).await?;
            sandbox.kill(&process, signal.as_deref()).await?;
            print_json(&serde_json::json!({ "killed": process }))
        }
        Commands::Release { id, process } => {
            let sandbox = manager.load_sandbox(&id).await?;
            sandbox.release(&process).await?;
            print_json(&serde_json::json!({ "released": process }))
        }
        Commands::Read {
            id,
            path,
            encoding,
            offset,
            limit,
        } => {
            let sandbox = manager.load_sandbox(&id).await?;
            let options = ReadOptions {
                encoding,
                offset,
                limit,
            };
            print_json(&sandbox.read_file(&path, options).await?)
        }
        Commands::Write {
            id,
            path,
            content,
            encoding,
        } => {
            let sandbox = manager.load_sandbox(&id).await?;
            let content = match content {
                Some(content) => content,
                None => read_stdin()?,
            };
            sandbox
                .write_file(&path, &content, WriteOptions::default().with_encoding(encoding))
                .await?;
            print_json(&serde_json::json!({ "written": path }))
        }
        Commands::Rm { id, path } => {
            let sandbox = manager.load_sandbox(&id).await?;
            sandbox.delete_file(&path).await?;
            print_json(&serde_json::json!({ "deleted": path }))
        }
        Commands::Ls {
            id,
            path,
            recursive,
            cursor,
            limit,
        } => {
            let sandbox = manager.load_sandbox(&id).await?;
            let options = ReadDirOptions {
                cursor,
                recursive,
                limit,
            };
            print_json(&sandbox.readdir(&path, options).await?)
        }
        Commands::Helper { .. } => Err(miette!("helper commands are dispatched before setup")),
    }
}

async fn run_helper(command: HelperCommands) -> Result<ExitCode> {
    match command {
        HelperCommands::Read {
            path,
            encoding,
            offset,
            limit,
        } => {
            let options = ReadOptions {
                encoding,
                offset,
                limit,
            };
            let Some(file) = helper::read_file(&path, &options).await? else {
                return Ok(ExitCode::from(HELPER_EXIT_ABSENT));
            };
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(file.content.as_bytes()).into_diagnostic()?;
            stdout.flush().into_diagnostic()?;
        }
        HelperCommands::Write { path, encoding } => {
            let bytes = content::decode(&read_stdin()?, encoding)?;
            helper::write_file(&path, &bytes).await?;
        }
        HelperCommands::Readdir {
            path,
            offset,
            limit,
            recursive,
        } => {
            let records = tokio::task::spawn_blocking(move || {
                helper::list_dir(&path, offset, limit, recursive)
            })
            .await
            .into_diagnostic()??;

            let mut stdout = std::io::stdout().lock();
            for record in records {
                writeln!(stdout, "{}", record.to_line()).into_diagnostic()?;
            }
            stdout.flush().into_diagnostic()?;
        }
        HelperCommands::Exec(exec) => {
            let mut command = exec.command.into_iter();
            let program = command.next().ok_or_else(|| miette!("missing command"))?;
            let code = supervise::run(supervise::SuperviseRequest {
                record_dir: exec.dir,
                output_byte_limit: exec.limit,
                cwd: exec.cwd,
                command: program,
                args: command.collect(),
            })
            .await?;
            return Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf).into_diagnostic()?;
    Ok(buf)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    println!("{json}");
    Ok(())
}
