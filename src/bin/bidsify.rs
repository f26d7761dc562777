use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bidsify::clean::clean_pass;
use bidsify::complete::{CompleteOptions, complete_pass};
use bidsify::config::ConfigLoader;
use bidsify::domain::{SessionLabel, SubjectLabel};
use bidsify::error::BidsifyError;
use bidsify::layout::DatasetLayout;
use bidsify::pipeline::{
    BidsValidatorClient, HeudiconvClient, MriDefaceClient, RunRequest, Workflow,
    write_failure_marker,
};
use bidsify::report::{self, OutputMode, PassReport};

#[derive(Parser)]
#[command(name = "bidsify")]
#[command(about = "BIDS conversion and sidecar metadata completion/cleaning")]
#[command(version, author)]
struct Cli {
    /// Emit machine-readable JSON instead of a human summary.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the full conversion pipeline for one subject")]
    Run(RunArgs),
    #[command(about = "Fill in IntendedFor, TotalReadoutTime and TaskName")]
    Complete(CompleteArgs),
    #[command(about = "Strip denylisted metadata from sidecars")]
    Clean(CleanArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Directory or tarball containing the raw DICOM data.
    #[arg(short = 'd', long)]
    dicom_dir: Utf8PathBuf,

    /// Path to the heudiconv heuristics file.
    #[arg(short = 'f', long)]
    heuristics: Utf8PathBuf,

    /// Subject label.
    #[arg(short = 's', long = "sub")]
    subject: String,

    /// Session label for longitudinal studies.
    #[arg(long = "ses")]
    session: Option<String>,

    /// Output BIDS dataset root.
    #[arg(short = 'o', long)]
    output_dir: Utf8PathBuf,

    /// Brain template for mri_deface.
    #[arg(long, default_value = "/src/deface/talairach_mixed_with_skull.gca")]
    brain_template: Utf8PathBuf,

    /// Face template for mri_deface.
    #[arg(long, default_value = "/src/deface/face.gca")]
    face_template: Utf8PathBuf,

    /// Cleaning config JSON ({"denylist": [...]}).
    #[arg(long)]
    config: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct CompleteArgs {
    /// BIDS dataset root.
    #[arg(short = 'd', long)]
    bids_dir: Utf8PathBuf,

    /// One or more subject labels.
    #[arg(short = 's', long = "sub", num_args = 1..)]
    subjects: Vec<String>,

    /// Session label for longitudinal studies.
    #[arg(long = "ses")]
    session: Option<String>,

    /// Replace existing derived fields.
    #[arg(short = 'o', long)]
    overwrite: bool,

    /// Write the per-file status artifact here.
    #[arg(long)]
    status_file: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct CleanArgs {
    /// BIDS dataset root.
    #[arg(short = 'd', long)]
    bids_dir: Utf8PathBuf,

    /// One or more subject labels.
    #[arg(short = 's', long = "sub", num_args = 1..)]
    subjects: Vec<String>,

    /// Session label for longitudinal studies.
    #[arg(long = "ses")]
    session: Option<String>,

    /// Cleaning config JSON ({"denylist": [...]}).
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    /// Write the per-file status artifact here.
    #[arg(long)]
    status_file: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<BidsifyError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &BidsifyError) -> u8 {
    match error {
        BidsifyError::SubjectNotFound(_) | BidsifyError::FileNotFound(_) => 2,
        BidsifyError::MissingTool(_) | BidsifyError::ToolFailed { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Run(args) => run_pipeline(args, mode),
        Commands::Complete(args) => run_complete(args, mode),
        Commands::Clean(args) => run_clean(args, mode),
    }
}

fn run_pipeline(args: RunArgs, mode: OutputMode) -> miette::Result<ExitCode> {
    let subject: SubjectLabel = args.subject.parse().into_diagnostic()?;
    let session = parse_session(args.session.as_deref())?;
    let clean_config = ConfigLoader::resolve(args.config.as_deref()).into_diagnostic()?;

    let converter = HeudiconvClient::new();
    if let Some(version) = converter.version() {
        info!(version = %version, "found heudiconv");
    }
    let validator = BidsValidatorClient::new();
    if let Some(version) = validator.version() {
        info!(version = %version, "found bids-validator");
    }
    let defacer = MriDefaceClient::new(args.brain_template, args.face_template);
    let workflow = Workflow::new(converter, defacer, validator, clean_config);

    let request = RunRequest {
        dicom_dir: args.dicom_dir,
        heuristics: args.heuristics,
        subject,
        session,
        output_dir: args.output_dir,
    };

    match workflow.run(&request) {
        Ok(summary) => {
            match mode {
                OutputMode::Json => report::print_json(&summary).into_diagnostic()?,
                OutputMode::Human => {
                    report::print_reports(mode, &summary.passes).into_diagnostic()?;
                    println!("validator report: {}", summary.validator_report);
                }
            }
            Ok(exit_code_for(&summary.passes))
        }
        Err(error) => {
            write_failure_marker(&request.output_dir, &error);
            Err(error).into_diagnostic()
        }
    }
}

fn run_complete(args: CompleteArgs, mode: OutputMode) -> miette::Result<ExitCode> {
    let layout = DatasetLayout::new(args.bids_dir);
    let session = parse_session(args.session.as_deref())?;
    let options = CompleteOptions {
        overwrite: args.overwrite,
    };

    let mut reports = Vec::new();
    for raw in &args.subjects {
        let subject: SubjectLabel = raw.parse().into_diagnostic()?;
        let mut set = layout
            .load_scope(&subject, session.as_ref())
            .into_diagnostic()?;
        reports.push(complete_pass(&mut set, options));
        let saved = set.save_dirty().into_diagnostic()?;
        info!(subject = %subject, files = saved.len(), "completion pass written");
    }

    finish_pass(mode, &reports, args.status_file.as_deref())
}

fn run_clean(args: CleanArgs, mode: OutputMode) -> miette::Result<ExitCode> {
    let layout = DatasetLayout::new(args.bids_dir);
    let session = parse_session(args.session.as_deref())?;
    let config = ConfigLoader::resolve(args.config.as_deref()).into_diagnostic()?;

    let mut reports = Vec::new();
    for raw in &args.subjects {
        let subject: SubjectLabel = raw.parse().into_diagnostic()?;
        let mut set = layout
            .load_scope(&subject, session.as_ref())
            .into_diagnostic()?;
        reports.push(clean_pass(&mut set, &config));
        let saved = set.save_dirty().into_diagnostic()?;
        info!(subject = %subject, files = saved.len(), "cleaning pass written");
    }

    finish_pass(mode, &reports, args.status_file.as_deref())
}

fn finish_pass(
    mode: OutputMode,
    reports: &[PassReport],
    status_file: Option<&camino::Utf8Path>,
) -> miette::Result<ExitCode> {
    if let Some(path) = status_file {
        report::write_status(path, reports).into_diagnostic()?;
    }
    report::print_reports(mode, reports).into_diagnostic()?;
    Ok(exit_code_for(reports))
}

fn exit_code_for(reports: &[PassReport]) -> ExitCode {
    if reports.iter().any(PassReport::has_failures) {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn parse_session(raw: Option<&str>) -> miette::Result<Option<SessionLabel>> {
    raw.filter(|value| *value != "None")
        .map(|value| value.parse::<SessionLabel>())
        .transpose()
        .into_diagnostic()
}
