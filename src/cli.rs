use crate::{
    catalog::{self, MojangVersions},
    config::AppConfig,
    fetch::{FileFetcher, HttpFetcher},
    ledger,
    manifest::InstallTarget,
    native::JavaRunner,
    reconcile::{InstallReport, Reconciler},
};
use anyhow::{bail, Context, Result};
use std::{path::PathBuf, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Install(InstallOptions),
    Status {
        dest: Option<PathBuf>,
        format: OutputFormat,
    },
    Help,
    Version,
}

#[derive(Debug, PartialEq, Eq)]
struct InstallOptions {
    pack: String,
    version: String,
    target: InstallTarget,
    dest: Option<PathBuf>,
    catalog: Option<PathBuf>,
    workers: Option<usize>,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("packsmith v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliCommand::Status { dest, format } => run_status(dest, format),
        CliCommand::Install(options) => run_install(options),
    }
}

fn parse_args(args: &[String]) -> Result<CliCommand> {
    let Some(head) = args.first() else {
        return Ok(CliCommand::Help);
    };
    match head.as_str() {
        "--help" | "-h" | "help" => Ok(CliCommand::Help),
        "--version" | "-V" | "version" => Ok(CliCommand::Version),
        "install" => parse_install(&args[1..]).map(CliCommand::Install),
        "status" => parse_status(&args[1..]),
        other => bail!("Unknown command: {other} (see --help)"),
    }
}

/// Splits `--flag=value` and `--flag value` into the flag's value.
fn flag_value<'a>(
    arg: &'a str,
    flag: &str,
    iter: &mut impl Iterator<Item = &'a String>,
) -> Result<Option<&'a str>> {
    if let Some(value) = arg
        .strip_prefix(flag)
        .and_then(|rest| rest.strip_prefix('='))
    {
        return Ok(Some(value));
    }
    if arg == flag {
        return match iter.next() {
            Some(value) => Ok(Some(value.as_str())),
            None => bail!("{flag} requires a value"),
        };
    }
    Ok(None)
}

fn parse_install(args: &[String]) -> Result<InstallOptions> {
    let mut positional = Vec::new();
    let mut target = InstallTarget::Client;
    let mut dest = None;
    let mut catalog = None;
    let mut workers = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = flag_value(arg, "--target", &mut iter)? {
            target = value.parse()?;
        } else if let Some(value) = flag_value(arg, "-t", &mut iter)? {
            target = value.parse()?;
        } else if let Some(value) = flag_value(arg, "--dest", &mut iter)? {
            dest = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(arg, "--catalog", &mut iter)? {
            catalog = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(arg, "--workers", &mut iter)? {
            let count: usize = value
                .parse()
                .with_context(|| format!("invalid worker count {value}"))?;
            workers = Some(count);
        } else if arg.starts_with('-') {
            bail!("Unknown install option: {arg}");
        } else {
            positional.push(arg.to_string());
        }
    }

    let mut positional = positional.into_iter();
    let (Some(pack), Some(version), None) =
        (positional.next(), positional.next(), positional.next())
    else {
        bail!("usage: packsmith install <pack> <version> [options]");
    };
    Ok(InstallOptions {
        pack,
        version,
        target,
        dest,
        catalog,
        workers,
    })
}

fn parse_status(args: &[String]) -> Result<CliCommand> {
    let mut dest = None;
    let mut format = OutputFormat::Text;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = flag_value(arg, "--dest", &mut iter)? {
            dest = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(arg, "--format", &mut iter)? {
            format = OutputFormat::parse(value)
                .with_context(|| format!("Unknown format: {value} (use 'text' or 'json')"))?;
        } else {
            bail!("Unknown status option: {arg}");
        }
    }
    Ok(CliCommand::Status { dest, format })
}

fn destination_or_cwd(dest: Option<PathBuf>) -> Result<PathBuf> {
    let dest = match dest {
        Some(dest) => dest,
        None => std::env::current_dir().context("resolve current dir")?,
    };
    if dest.is_absolute() {
        return Ok(dest);
    }
    Ok(std::env::current_dir()
        .context("resolve current dir")?
        .join(dest))
}

fn run_install(options: InstallOptions) -> Result<()> {
    let config = AppConfig::load_or_create()?;
    let mut installer_config = config.installer_config()?;
    if let Some(workers) = options.workers {
        installer_config.max_workers = workers.max(1);
    }
    let destination = destination_or_cwd(options.dest)?;

    let fetcher: Arc<dyn FileFetcher> = Arc::new(HttpFetcher::new(&config.user_agent));
    let catalog = catalog::catalog_for(
        options.catalog.as_deref(),
        &config.catalog_url,
        fetcher.clone(),
    );
    let manifest = catalog
        .manifest(&options.pack, &options.version)
        .with_context(|| format!("load pack {} version {}", options.pack, options.version))?;

    println!(
        "Installing {} into {}...",
        manifest.display_name(),
        destination.display()
    );
    let reconciler = Reconciler::new(
        installer_config,
        fetcher.clone(),
        Arc::new(JavaRunner::new(&config.java)),
        Arc::new(MojangVersions::new(fetcher)),
    );
    let report = reconciler
        .install_pack_version(options.target, &destination, &manifest)
        .context("install pack")?;
    print_report(&report, &config.data_dir_name);
    if !report.is_clean() {
        bail!("install finished with errors");
    }
    Ok(())
}

fn print_report(report: &InstallReport, data_dir_name: &str) {
    println!(
        "Installed {}, unchanged {}, removed {}.",
        report.installed.len(),
        report.skipped.len(),
        report.deleted.len()
    );
    if !report.preserved_conflicts.is_empty() {
        println!("Kept local changes (new versions are under {data_dir_name}/):");
        for path in &report.preserved_conflicts {
            println!("  {path}");
        }
    }
    if !report.retained.is_empty() {
        println!("Removed from the pack but kept because they were modified:");
        for path in &report.retained {
            println!("  {path}");
        }
    }
    if !report.errors.is_empty() {
        println!("Errors:");
        for err in &report.errors {
            println!("  {err}");
        }
    }
    for loader in &report.loaders {
        match &loader.result {
            Ok(outcome) => println!("{}: {outcome:?}", loader.component),
            Err(err) => println!("{}: failed: {err}", loader.component),
        }
    }
}

fn run_status(dest: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let config = AppConfig::load_or_create()?;
    let destination = destination_or_cwd(dest)?;
    let data_dir = destination.join(&config.data_dir_name);
    let Some(ledger) = ledger::load_ledger(&data_dir)? else {
        println!("No pack is installed at {}", destination.display());
        return Ok(());
    };
    match format {
        OutputFormat::Json => {
            let raw = serde_json::to_string_pretty(&ledger).context("serialize ledger")?;
            println!("{raw}");
        }
        OutputFormat::Text => {
            println!("Destination: {}", destination.display());
            println!("Pack:        {} v{}", ledger.pack_id, ledger.version_id);
            println!("Target:      {}", ledger.target);
            println!("Tracked:     {} files ({})", ledger.entries.len(), ledger.algorithm);
            if let Some(updated) = &ledger.updated_at {
                println!("Updated:     {updated}");
            }
        }
    }
    Ok(())
}

fn print_help() {
    println!("packsmith v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  packsmith install <pack> <version>  Install or upgrade a pack");
    println!("  packsmith status                    Show the pack installed at a destination");
    println!();
    println!("Install options:");
    println!("  -t, --target <client|server>         Install target (default client)");
    println!("  --dest <dir>                         Destination (default current dir)");
    println!("  --catalog <dir>                      Read manifests from <dir>/<pack>/<version>.json");
    println!("  --workers <n>                        Parallel downloads");
    println!();
    println!("Status options:");
    println!("  --dest <dir>                         Destination (default current dir)");
    println!("  --format <json|text>                 Output format");
    println!();
    println!("Global options:");
    println!("  -h, --help                           Show help");
    println!("  -V, --version                        Show version");
    println!();
    println!("Set PACKSMITH_LOG (e.g. debug) to change log verbosity.");
}
