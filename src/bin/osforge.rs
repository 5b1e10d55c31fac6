use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use osforge::artifact::filesystem::human_readable_size;
use osforge::pipeline::{BuildReport, Pipeline};
use osforge::preflight::{self, Operation};
use osforge::{Config, Manifest};

/// Build immutable OS images from a manifest.
#[derive(Parser, Debug)]
#[command(name = "osforge", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Manifest file
    #[arg(short, long, global = true, env = "OSFORGE_MANIFEST", default_value = "manifest.toml")]
    manifest: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true, env = "OSFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download and cache every package source and the kernel tarball
    Fetch,
    /// Build every package, the kernel and the initrd
    Build,
    /// Build everything, then assemble the system image
    Assemble,
    /// Remove cache entries the manifest no longer references
    Gc,
    /// Build the kernel
    Kernel,
    /// Build the initrd
    Initrd,
    /// Run or reset the development VM
    Vm {
        #[command(subcommand)]
        command: VmCommands,
    },
    /// Remove build outputs
    Clean {
        /// Also remove the cache, kernel, initrd and VM state
        #[arg(long)]
        all: bool,
    },
    /// Show cache usage, outputs and missing host tools
    Status,
    /// Push the image to a registry
    Push,
}

#[derive(Subcommand, Debug)]
enum VmCommands {
    /// Boot the assembled image
    Run {
        /// Kernel command line
        #[arg(long)]
        append: Option<String>,
        /// Extra QEMU arguments, after `--`
        #[arg(last = true)]
        qemu_args: Vec<String>,
    },
    /// Recreate the user-data disk
    Reset,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if let Some(hint) = e.downcast_ref::<osforge::Error>().and_then(|e| e.hint()) {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env("OSFORGE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let manifest = Manifest::load(&cli.manifest)
        .with_context(|| format!("loading manifest {}", cli.manifest.display()))?;
    let manifest_dir = manifest_dir(&cli.manifest)?;
    let config = Config::load(cli.config.as_deref(), &manifest_dir).context("loading config")?;
    let pipeline = Pipeline::new(&manifest, &config)?;

    match cli.command {
        Commands::Fetch => {
            preflight_for(Operation::Fetch, &config, &manifest)?;
            let results = pipeline.fetch();
            let mut failed = Vec::new();
            for (unit, result) in &results {
                match result {
                    Ok(source) => println!("{unit}: {}", source.fingerprint.short()),
                    Err(e) => {
                        eprintln!("{unit}: {e}");
                        failed.push(unit.as_str());
                    }
                }
            }
            if !failed.is_empty() {
                bail!("fetch failed for: {}", failed.join(", "));
            }
        }
        Commands::Build => {
            preflight_for(Operation::Build, &config, &manifest)?;
            let report = pipeline.build()?;
            check_report(&report)?;
            println!("built {} package(s)", report.packages.len());
        }
        Commands::Assemble => {
            preflight_for(Operation::Assemble, &config, &manifest)?;
            let report = pipeline.build()?;
            print_failures(&report);
            let image = pipeline.assemble(&report).context("assembling image")?;
            let state = if image.reused { "up to date" } else { "written" };
            println!("{} ({state})", image.image_path.display());
        }
        Commands::Gc => {
            preflight_for(Operation::Gc, &config, &manifest)?;
            let stats = pipeline.gc().context("garbage collecting cache")?;
            println!(
                "removed {} source(s), {} artifact(s), {} temp dir(s); freed {}",
                stats.removed_sources,
                stats.removed_artifacts,
                stats.removed_temp,
                human_readable_size(stats.freed_bytes)
            );
            if stats.skipped_in_use > 0 {
                println!("skipped {} entr(ies) in use", stats.skipped_in_use);
            }
        }
        Commands::Kernel => {
            preflight_for(Operation::Kernel, &config, &manifest)?;
            let kernel = pipeline.build_kernel().context("building kernel")?;
            for warning in &kernel.warnings {
                eprintln!("warning: {warning}");
            }
            println!("{} ({})", kernel.image_path.display(), kernel.release);
        }
        Commands::Initrd => {
            preflight_for(Operation::Initrd, &config, &manifest)?;
            let initrd = pipeline.build_initrd().context("building initrd")?;
            println!("{}", initrd.image_path.display());
        }
        Commands::Vm { command } => match command {
            VmCommands::Run { append, qemu_args } => {
                preflight_for(Operation::VmRun, &config, &manifest)?;
                pipeline
                    .run_vm(append.as_deref(), &qemu_args)
                    .context("running VM")?;
            }
            VmCommands::Reset => {
                preflight_for(Operation::VmReset, &config, &manifest)?;
                let disk = pipeline.reset_vm().context("resetting VM")?;
                println!("{}", disk.display());
            }
        },
        Commands::Clean { all } => pipeline.clean(all)?,
        Commands::Status => print_status(&pipeline, &config, &manifest)?,
        Commands::Push => bail!("push is unimplemented"),
    }
    Ok(())
}

fn manifest_dir(manifest: &Path) -> Result<PathBuf> {
    let dir = match manifest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    dir.canonicalize()
        .with_context(|| format!("resolving {}", dir.display()))
}

fn preflight_for(op: Operation, config: &Config, manifest: &Manifest) -> Result<()> {
    let tools = preflight::required_tools(op, &config.container_runtime, manifest);
    preflight::check_required_tools(&tools)?;
    Ok(())
}

fn print_failures(report: &BuildReport) {
    for (unit, err) in report.failures() {
        eprintln!("{unit}: {err}");
    }
}

fn check_report(report: &BuildReport) -> Result<()> {
    print_failures(report);
    let failed: Vec<&str> = report.failures().into_iter().map(|(unit, _)| unit).collect();
    if !failed.is_empty() {
        bail!("build failed for: {}", failed.join(", "));
    }
    Ok(())
}

fn print_status(pipeline: &Pipeline, config: &Config, manifest: &Manifest) -> Result<()> {
    let status = pipeline.status()?;
    println!("output:    {}", pipeline.layout().root().display());
    println!(
        "sources:   {} entr(ies), {}",
        status.cache.sources.entries,
        human_readable_size(status.cache.sources.bytes)
    );
    println!(
        "artifacts: {} entr(ies), {}",
        status.cache.artifacts.entries,
        human_readable_size(status.cache.artifacts.bytes)
    );
    if status.cache.temp_dirs > 0 {
        println!("temp:      {} dir(s), run `osforge gc` to sweep", status.cache.temp_dirs);
    }
    match &status.image {
        Some(image) => println!("image:     {}", image.display()),
        None => println!("image:     not assembled"),
    }

    let mut tools = Vec::new();
    for op in [Operation::Assemble, Operation::VmRun, Operation::Fetch] {
        for tool in preflight::required_tools(op, &config.container_runtime, manifest) {
            if !tools.contains(&tool) {
                tools.push(tool);
            }
        }
    }
    for tool in preflight::missing_tools(&tools) {
        println!("missing:   {} (install: {})", tool.command, tool.package);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_run_passes_trailing_args_to_qemu() {
        let cli = Cli::try_parse_from([
            "osforge", "vm", "run", "--append", "quiet", "--", "-s", "-device", "virtio-rng-pci",
        ])
        .unwrap();
        match cli.command {
            Commands::Vm {
                command: VmCommands::Run { append, qemu_args },
            } => {
                assert_eq!(append.as_deref(), Some("quiet"));
                assert_eq!(qemu_args, ["-s", "-device", "virtio-rng-pci"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
