use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser, Subcommand};
use log::{info, warn};
use roster_core::ingest::read_files;
use roster_core::{
    DEFAULT_IGNORED_ORGANIZATION, ImportOptions, ImportReport, Importer, OrgMappingSource,
    Parallelism,
};
use time::OffsetDateTime;

mod connect;
mod export;

use connect::ConnectionArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose());
    match cli.command {
        Command::Import(args) => import(args).await,
        Command::Provision(args) => provision(args).await,
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Reconcile identity documents against an identity store"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn verbose(&self) -> bool {
        match &self.command {
            Command::Import(args) => args.verbose,
            Command::Provision(_) => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Import identity documents and reconcile affiliations.
    Import(ImportArgs),
    /// Create the identity tables in an empty database.
    Provision(ProvisionArgs),
}

#[derive(Parser)]
struct ImportArgs {
    /// YAML identity documents, processed in the order given.
    #[arg(required = true)]
    files: Vec<PathBuf>,
    #[command(flatten)]
    connection: ConnectionArgs,
    #[arg(long, env = "DEBUG", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    verbose: bool,
    /// Resolve and canonicalize without touching affiliations.
    #[arg(long, env = "DRY", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    dry_run: bool,
    /// Compare stored profiles, aliases and affiliations before writing.
    #[arg(long, env = "COMPARE", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    compare: bool,
    /// Replace stored affiliations that differ from the document.
    #[arg(long, env = "REPLACE", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    replace: bool,
    /// Process records one at a time.
    #[arg(long, env = "ST", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    sequential: bool,
    /// Worker count; defaults to the available CPUs.
    #[arg(long, env = "NCPUS")]
    workers: Option<usize>,
    /// Project slug the imported affiliations belong to.
    #[arg(long, env = "PROJECT_SLUG")]
    project_scope: Option<String>,
    /// YAML file of `mappings: [[pattern, organization], ...]`.
    #[arg(long, env = "ORGS_MAP_FILE")]
    org_mapping: Option<PathBuf>,
    /// Organization names treated as "no affiliation".
    #[arg(long = "ignore-org", default_value = DEFAULT_IGNORED_ORGANIZATION)]
    ignored_organizations: Vec<String>,
    #[arg(long, env = "MISSING_PROFILES_CSV", default_value = "missing_profiles")]
    missing_profiles_csv: String,
    #[arg(long, env = "MISSING_ORGS_CSV", default_value = "missing_orgs")]
    missing_orgs_csv: String,
    /// Directory the CSV reports are written to.
    #[arg(long, default_value = ".")]
    report_dir: PathBuf,
}

impl ImportArgs {
    fn parallelism(&self) -> Parallelism {
        if self.sequential {
            return Parallelism::Sequential;
        }
        let cpus = Parallelism::default().worker_count();
        match self.workers {
            Some(requested) => Parallelism::from_count(Some(requested.min(cpus))),
            None => Parallelism::default(),
        }
    }

    fn options(&self) -> ImportOptions {
        ImportOptions {
            parallelism: self.parallelism(),
            verbose: self.verbose,
            compare: self.compare,
            replace: self.replace,
            dry_run: self.dry_run,
            project_scope: self
                .project_scope
                .clone()
                .filter(|scope| !scope.is_empty()),
            org_mapping: match &self.org_mapping {
                Some(path) => OrgMappingSource::File { path: path.clone() },
                None => OrgMappingSource::None,
            },
            ignored_organizations: self.ignored_organizations.clone(),
        }
    }
}

#[derive(Parser)]
struct ProvisionArgs {
    #[command(flatten)]
    connection: ConnectionArgs,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

async fn import(args: ImportArgs) -> Result<()> {
    let started = Instant::now();
    let records = read_files(&args.files).context("read identity documents")?;
    info!("read {} records from {} file(s)", records.len(), args.files.len());

    let store = args.connection.open().await?;
    let options = args.options();
    info!(
        "importing with {} worker(s), compare={} replace={} dry_run={}",
        options.parallelism.worker_count(),
        options.compare,
        options.replace,
        options.dry_run
    );
    let report = Importer::new(&store, options)
        .run(records)
        .await
        .context("import identities")?;

    write_reports(&args, &report)?;
    println!(
        "resolved={} skipped={} unresolved={} missing_orgs={} known_orgs={}",
        report.resolved,
        report.skipped,
        report.unresolved.len(),
        report.missing_organizations.len(),
        report.organizations_known
    );
    if !args.dry_run {
        println!("{}", report.stats);
    }
    println!("elapsed {:.3?}", started.elapsed());
    Ok(())
}

fn write_reports(args: &ImportArgs, report: &ImportReport) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    if !report.unresolved.is_empty() {
        let path = export::report_path(&args.report_dir, &args.missing_profiles_csv, now)?;
        export::write_unresolved(create(&path)?, &report.unresolved)?;
        warn!(
            "{} unresolved records written to {}",
            report.unresolved.len(),
            path.display()
        );
    }
    if !report.missing_organizations.is_empty() {
        let path = export::report_path(&args.report_dir, &args.missing_orgs_csv, now)?;
        export::write_missing_organizations(create(&path)?, &report.missing_organizations)?;
        warn!(
            "{} unknown organizations written to {}",
            report.missing_organizations.len(),
            path.display()
        );
    }
    Ok(())
}

fn create(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("failed to create {}", path.display()))
}

async fn provision(args: ProvisionArgs) -> Result<()> {
    let store = args.connection.open().await?;
    store.provision().await.context("create identity tables")?;
    println!("identity tables ready ({:?})", store.backend());
    Ok(())
}
