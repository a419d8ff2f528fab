mod error;
mod extract;
mod ignore;
mod observe;
mod triage;

use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::{debug, info, warn};

use crashly_symbols::{
    BuildDate, CommandDumpGenerator, Resolver, StoreConfig, SymbolCache, SymbolStore,
};

use error::CliError;
use extract::{ExtractOptions, ExtractOutcome, Extractor, Mode};
use ignore::IgnoreSet;
use observe::LineObserver;
use triage::{TriageAggregator, TriageOptions};

#[derive(Debug, Parser)]
#[command(
    name = "crashly",
    version,
    about = r#"
crashly resolves application crash logs against offline symbol dumps and
triages many logs into common failure signatures.

EXAMPLES:
    # Resolve one log and print the symbolicated reconstruction:
    crashly resolve --symbols ./symbols data/log_latest.txt

    # Triage a batch of uploaded crash logs:
    crashly triage --symbols ./symbols server/sync/crash/*.txt.gz

    # Only consider builds from this version onward:
    crashly triage --symbols ./symbols --min-version 2024_01_01 logs/*.gz
"#
)]
struct Opt {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Resolve one crash log and print the symbolicated log text.
    Resolve(ResolveArgs),

    /// Extract and group crash signatures from a batch of logs.
    Triage(TriageArgs),
}

#[derive(Debug, Args)]
struct SharedArgs {
    /// Symbol store root directory. May be given multiple times.
    #[arg(long = "symbols", value_name = "DIR")]
    symbol_roots: Vec<PathBuf>,

    /// Minimum build version (YYYY_MM_DD); older logs are skipped.
    #[arg(long, value_name = "VERSION")]
    min_version: Option<String>,

    /// Stem of the main application binary, used to tag versioned modules.
    #[arg(long, value_name = "NAME")]
    app: Option<String>,

    /// File with one ignored frame name per line ('#' starts a comment).
    #[arg(long, value_name = "FILE")]
    ignore_file: Option<PathBuf>,

    /// Calendar-day window for fuzzy symbol version fallback.
    #[arg(long, default_value_t = 2, value_name = "DAYS")]
    tolerance_days: i64,

    /// Shell command generating a missing symbol dump; `{module}` is
    /// replaced with the module name and stdout is cached as the dump.
    #[arg(long, value_name = "CMD")]
    dump_command: Option<String>,
}

impl SharedArgs {
    fn min_version(&self) -> Result<Option<BuildDate>, CliError> {
        match &self.min_version {
            None => Ok(None),
            Some(text) => match BuildDate::parse_version(text) {
                Some(date) => Ok(Some(date)),
                None => Err(CliError::BadVersionFilter(text.clone())),
            },
        }
    }

    fn ignore_set(&self) -> Result<IgnoreSet, CliError> {
        match &self.ignore_file {
            Some(path) => IgnoreSet::from_file(path),
            None => Ok(IgnoreSet::default()),
        }
    }

    fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig {
            roots: self.symbol_roots.clone(),
            tolerance_days: self.tolerance_days,
            ..StoreConfig::default()
        };
        if config.roots.is_empty() {
            config.roots.push(PathBuf::from("."));
        }
        if let Some(command) = &self.dump_command {
            config.generator = Some(Box::new(CommandDumpGenerator::new(command.clone())));
        }
        config
    }

    fn extract_options(&self, mode: Mode) -> Result<ExtractOptions, CliError> {
        let mut options = ExtractOptions::new(mode);
        options.min_version = self.min_version()?;
        options.app_hint = self.app.clone();
        Ok(options)
    }
}

#[derive(Debug, Args)]
struct ResolveArgs {
    /// Path to the crash log (plain text or gzip).
    log: PathBuf,

    /// Echo every line of the log, not only the crash region.
    #[arg(short = 'a', long)]
    all: bool,

    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Debug, Args)]
struct TriageArgs {
    /// Paths to the crash logs (plain text or gzip).
    #[arg(required = true)]
    logs: Vec<PathBuf>,

    /// Emit the grouped result as JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Signature depth: stop collecting once this many distinct frames
    /// include an application frame.
    #[arg(long, default_value_t = 4, value_name = "FRAMES")]
    depth: usize,

    /// Stop listing buckets below this share of reports...
    #[arg(long, default_value_t = 1.0, value_name = "PERCENT")]
    noise_percent: f64,

    /// ...once this much cumulative coverage has been printed.
    #[arg(long, default_value_t = 80.0, value_name = "PERCENT")]
    coverage_percent: f64,

    #[command(flatten)]
    shared: SharedArgs,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::parse();
    let result = match opt.action {
        Action::Resolve(args) => run_resolve(args),
        Action::Triage(args) => run_triage(args),
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run_resolve(args: ResolveArgs) -> Result<(), CliError> {
    let ignore = args.shared.ignore_set()?;
    let store = SymbolStore::new(args.shared.store_config());
    let cache = SymbolCache::new();
    let mut options = args.shared.extract_options(Mode::Full)?;
    options.echo_all = args.all;
    let extractor = Extractor::new(Resolver::new(&store, &cache), &ignore, options);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut observers: Vec<Box<dyn LineObserver>> = Vec::new();
    match extractor.extract_file(&args.log, &mut observers, &mut out)? {
        ExtractOutcome::Excluded(reason) => {
            writeln!(out, "excluded: {reason}")?;
        }
        ExtractOutcome::Report(report) => {
            if let Some(cause) = &report.cause {
                writeln!(out, "likely cause: {}", cause.signature_frame())?;
            }
            if !report.signature.is_empty() {
                writeln!(out, "signature: {}", report.signature.join(" <- "))?;
            }
        }
    }
    Ok(())
}

fn run_triage(args: TriageArgs) -> Result<(), CliError> {
    let ignore = args.shared.ignore_set()?;
    let store = SymbolStore::new(args.shared.store_config());
    let cache = SymbolCache::new();
    let mut options = args.shared.extract_options(Mode::Triage)?;
    options.triage_depth = args.depth;
    let extractor = Extractor::new(Resolver::new(&store, &cache), &ignore, options);

    let mut aggregator = TriageAggregator::new();
    let mut sink = io::sink();
    for path in &args.logs {
        let mut observers: Vec<Box<dyn LineObserver>> = Vec::new();
        match extractor.extract_file(path, &mut observers, &mut sink) {
            Ok(ExtractOutcome::Report(report)) => {
                let version = cache.effective_version(&report.version);
                aggregator.add(version, &report);
            }
            Ok(ExtractOutcome::Excluded(reason)) => {
                debug!("{}: {reason}", path.display());
            }
            // One bad log never aborts the batch.
            Err(err) => {
                warn!("skipping {err}");
            }
        }
    }
    info!(
        "triage found {} matches over {} logs",
        aggregator.matches(),
        args.logs.len()
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &aggregator.summary()).map_err(io::Error::from)?;
        writeln!(out)?;
    } else {
        let triage_options = TriageOptions {
            noise_threshold_percent: args.noise_percent,
            coverage_target_percent: args.coverage_percent,
            ..TriageOptions::default()
        };
        aggregator.render(&mut out, &triage_options)?;
    }
    Ok(())
}
