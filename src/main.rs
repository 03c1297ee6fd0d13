use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use traceship::config::Config;
use traceship::manifest::{build_manifest, resolve_repositories};
use traceship::trace::TraceDir;
use traceship::upload::{check_credentials, compress_and_sign, upload_payload, Signer};

#[derive(Parser, Debug)]
#[command(
    name = "traceship",
    version,
    about = "Prepare a recorded execution trace for remote analysis and upload it"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Finalize a trace for upload without uploading: resolve source
    /// provenance, write archives and the sources manifest
    Prepare(PrepareArgs),
    /// Prepare the trace, then compress, sign, and upload it
    Upload(UploadArgs),
}

#[derive(Parser, Debug)]
struct PrepareArgs {
    /// Trace directory to finalize
    #[arg(long, value_name = "DIR")]
    trace: PathBuf,

    /// Source directory allowed to be embedded (repeatable)
    #[arg(long = "allow", value_name = "DIR")]
    allowed: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
struct UploadArgs {
    #[command(flatten)]
    prepare: PrepareArgs,

    /// Extra metadata appended verbatim to the upload metadata string
    #[arg(long, value_name = "STR")]
    metadata: Option<String>,

    /// Stop after signing: print the derived upload key, contact no remote
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("traceship=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Prepare(args) => cmd_prepare(&args).map(|_| ()),
        Commands::Upload(args) => cmd_upload(args),
    }
}

/// Realize the allow-list before any path comparison: the partition
/// predicate works on canonical absolute paths only.
fn realize_allow_list(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    dirs.iter()
        .map(|dir| {
            dir.canonicalize()
                .with_context(|| format!("resolve allowed directory {}", dir.display()))
        })
        .collect()
}

fn cmd_prepare(args: &PrepareArgs) -> Result<TraceDir> {
    let allowed = realize_allow_list(&args.allowed)?;
    let trace = TraceDir::open(&args.trace)?;
    let doc = trace.load_sources()?;
    trace.copy_external_debug_info(&doc.external_debug_info)?;
    let buckets = resolve_repositories(&doc.files)?;
    let summary = build_manifest(&trace, &doc, &buckets, &allowed)?;
    println!(
        "Prepared {}: {} explicit files ({} embedded, {} placeholders), {} remote mounts",
        args.trace.display(),
        summary.explicit_files,
        summary.embedded,
        summary.placeholders,
        summary.url_mounts
    );
    Ok(trace)
}

fn cmd_upload(args: UploadArgs) -> Result<()> {
    let config = Config::from_env()?;
    let signer = Signer::from_pkcs8_der(&config.signing_key_der)?;

    let trace = cmd_prepare(&args.prepare)?;
    let payload = compress_and_sign(trace.root(), &signer)?;

    if args.dry_run {
        println!("Dry run: payload signed, upload key would be {}.tar.zst", payload.nonce);
        return Ok(());
    }

    check_credentials(&config, &signer.public_key_stripped_pem()?)?;
    let key = upload_payload(&config, &signer, &payload, args.metadata.as_deref())?;
    println!("Uploaded trace as {key}");
    Ok(())
}
