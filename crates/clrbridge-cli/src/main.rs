#[cfg(windows)]
mod live;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use clrbridge::{DirectoryLocator, ResolveOptions, TargetSession};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const PATH_LIST_SEPARATOR: char = if cfg!(windows) { ';' } else { ':' };

#[derive(Parser)]
#[command(name = "clrbridge")]
#[command(about = "Discover .NET runtimes in a process and resolve their DAC")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List runtimes loaded in a process
    Runtimes(TargetArgs),
    /// Resolve and validate the DAC for each runtime
    Resolve {
        #[command(flatten)]
        target: TargetArgs,
        /// DAC to use instead of searching
        #[arg(long, env = "CLRBRIDGE_DAC")]
        dac: Option<PathBuf>,
        /// Accept a DAC whose version differs from the runtime
        #[arg(long)]
        ignore_mismatch: bool,
        /// Directories searched when no local DAC matches
        #[arg(long = "search", env = "CLRBRIDGE_DAC_SEARCH", value_delimiter = PATH_LIST_SEPARATOR)]
        search: Vec<PathBuf>,
        /// Also load each DAC and create its process interface
        #[arg(long)]
        load: bool,
    },
    /// List modules loaded in a process
    Modules(TargetArgs),
}

#[derive(Args)]
struct TargetArgs {
    /// Process ID to inspect
    #[arg(short, long)]
    pid: u32,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose {
        "clrbridge=debug"
    } else {
        "clrbridge=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .context("invalid log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Runtimes(target) => list_runtimes(&open_session(target.pid)?),
        Commands::Modules(target) => list_modules(&open_session(target.pid)?),
        Commands::Resolve {
            target,
            dac,
            ignore_mismatch,
            search,
            load,
        } => {
            let mut session = open_session(target.pid)?;
            if !search.is_empty() {
                session = session.with_locator(Arc::new(DirectoryLocator::new(search)));
            }

            let mut options = ResolveOptions::new().ignore_mismatch(ignore_mismatch);
            if let Some(dac) = dac {
                options = options.dac_path(dac);
            }
            resolve(&session, &options, load)
        }
    }
}

#[cfg(windows)]
fn open_session(pid: u32) -> Result<TargetSession> {
    let reader =
        live::ProcessReader::open(pid).with_context(|| format!("failed to open process {pid}"))?;
    Ok(TargetSession::new(Arc::new(reader)))
}

#[cfg(not(windows))]
fn open_session(pid: u32) -> Result<TargetSession> {
    bail!("live attach to process {pid} is not supported on this platform")
}

fn list_modules(session: &TargetSession) -> Result<()> {
    let modules = session.modules().context("failed to enumerate modules")?;

    println!("\n=== Modules ({}) ===\n", modules.len());
    for module in modules {
        let version = module
            .file_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".into());
        let marker = if module.is_runtime { "*" } else { " " };
        println!(
            "{} 0x{:016X} 0x{:08X} {:<16} {}",
            marker, module.base_address, module.size, version, module.path
        );
    }
    Ok(())
}

fn list_runtimes(session: &TargetSession) -> Result<()> {
    let runtimes = session.runtimes().context("failed to discover runtimes")?;

    println!("\n=== Runtimes ({}) ===\n", runtimes.len());
    for runtime in runtimes {
        println!("  {} ({:?})", runtime, runtime.platform);
        println!("    Module: {}", runtime.module.path);
        println!("    Base: 0x{:X}", runtime.module.base_address);
        println!("    DAC: {}", runtime.dac.file_name);
        println!("    Request: {}", runtime.dac.request_file_name);
        match &runtime.local_dac {
            Some(path) => println!("    Local DAC: {}", path.display()),
            None => println!("    Local DAC: none"),
        }
        println!();
    }

    if let Some(native) = session.native_runtime()? {
        println!(
            "Native runtime: {} at 0x{:X}",
            native.path, native.base_address
        );
    }
    Ok(())
}

fn resolve(session: &TargetSession, options: &ResolveOptions, load: bool) -> Result<()> {
    let runtimes = session.runtimes().context("failed to discover runtimes")?;
    if runtimes.is_empty() {
        bail!("no runtimes found");
    }

    let mut failures = 0usize;
    for runtime in runtimes {
        let result = if load {
            session.create_runtime(runtime, options).map(|clr| {
                let sos = clr.process().map(|p| p.sos_interface().is_some());
                (clr.dac().to_string(), Some((clr.layout(), sos)))
            })
        } else {
            session
                .resolve_dac(runtime, options)
                .map(|resolved| (resolved.path.display().to_string(), None))
        };

        match result {
            Ok((dac, loaded)) => {
                println!("  [OK] {} -> {}", runtime, dac);
                if let Some((layout, sos)) = loaded {
                    println!("    Layout: {:?}", layout);
                    println!("    ISOSDacInterface: {}", matches!(sos, Ok(true)));
                }
            }
            Err(e) => {
                warn!("DAC resolution failed for {}: {}", runtime, e);
                println!("  [FAIL] {} - {}", runtime, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} runtimes could not be resolved", runtimes.len());
    }
    Ok(())
}
