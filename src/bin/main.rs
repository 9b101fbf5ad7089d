use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rpkilog::config::Config;
use rpkilog::diff::DiffArtifact;
use rpkilog::index::{EsClient, backfill, load_diff_from_store};
use rpkilog::lineage::run_diff;
use rpkilog::store::{FsObjectStore, ObjectStore, S3ObjectStore};
use rpkilog::summary::{Summary, ingest_snapshot, store_summary};
use rpkilog::{Result, RpkilogError};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[clap(author, version)]
#[clap(propagate_version = true)]
#[command(arg_required_else_help(true))]
/// Maintain a time-indexed, searchable history of RPKI VRP data.
struct Cli {
    /// Configuration file (TOML); RPKILOG_* environment variables override it
    #[clap(short, long)]
    config: Option<String>,

    /// Use a local directory as the object store instead of S3
    #[clap(long)]
    local_store: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a local snapshot TAR; upload the summary or write it locally
    Summarize {
        /// Input TAR file (.tgz)
        #[clap(long)]
        input_tar: PathBuf,
        /// Write the summary to this file instead of uploading it
        #[clap(long)]
        output: Option<PathBuf>,
    },
    /// Ingest a snapshot object from the snapshot bucket
    Ingest {
        /// Snapshot key, e.g. rpki-20221030T183500Z.tgz
        key: String,
    },
    /// Diff two local summary files and write the diff artifact
    Diff {
        /// Old input JSON file
        #[clap(long)]
        old_file: PathBuf,
        /// New input JSON file
        #[clap(long)]
        new_file: PathBuf,
        /// Results are saved in JSON format to this file
        #[clap(long)]
        result_file: PathBuf,
        /// Overwrite an existing result file
        #[clap(long)]
        overwrite: bool,
    },
    /// Diff a summary in the bucket against its predecessor and upload
    Resolve {
        /// Summary key, e.g. 20221030T183500Z.json.bz2
        new_key: String,
    },
    /// Load one diff artifact from the diff bucket into the search index
    Load {
        /// Diff key, e.g. 20221030T183500Z.vrpdiff.json.bz2
        key: String,
    },
    /// Load all diff artifacts, newest first
    Backfill {
        /// Skip diffs observed before this date
        #[clap(long)]
        date_min: Option<NaiveDate>,
        /// Skip diffs observed after this date
        #[clap(long)]
        date_max: Option<NaiveDate>,
        /// Stop after loading this many files
        #[clap(long)]
        max_files: Option<usize>,
    },
}

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}

fn open_store(cli: &Cli, config: &Config) -> Result<Box<dyn ObjectStore>> {
    match &cli.local_store {
        Some(root) => Ok(Box::new(FsObjectStore::new(root))),
        None => Ok(Box::new(S3ObjectStore::new(
            &config.s3_region,
            config.s3_endpoint.clone(),
        )?)),
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Summarize { input_tar, output } => {
            let (timestamp, summary) = Summary::from_snapshot_tar(input_tar)?;
            match output {
                Some(path) => {
                    summary.write_to_file(path)?;
                    info!("wrote summary to {}", path.display());
                }
                None => {
                    let store = open_store(&cli, &config)?;
                    store_summary(
                        store.as_ref(),
                        &config.summary_bucket,
                        &config.scratch_dir,
                        config.keep_scratch,
                        &timestamp,
                        &summary,
                    )?;
                }
            }
            println!("{}", serde_json::to_string_pretty(&summary.metadata)?);
        }
        Commands::Ingest { key } => {
            let store = open_store(&cli, &config)?;
            let summary_key = ingest_snapshot(
                store.as_ref(),
                &config.snapshot_bucket,
                &config.summary_bucket,
                &config.scratch_dir,
                config.keep_scratch,
                key,
            )?;
            println!("{}", summary_key);
        }
        Commands::Diff {
            old_file,
            new_file,
            result_file,
            overwrite,
        } => {
            if result_file.exists() && !overwrite {
                return Err(RpkilogError::Internal(format!(
                    "result file {} exists; pass --overwrite to replace it",
                    result_file.display()
                )));
            }
            info!("loading old data from {}", old_file.display());
            let old = Summary::from_file(old_file)?;
            info!("loading new data from {}", new_file.display());
            let new = Summary::from_file(new_file)?;
            info!(
                "diff-ing {} old and {} new records ...",
                old.roas.len(),
                new.roas.len()
            );
            let artifact = DiffArtifact::build(
                &old,
                &old_file.to_string_lossy(),
                &new,
                &new_file.to_string_lossy(),
            )?;
            let mut writer = oneio::get_writer(&result_file.to_string_lossy())?;
            writer.write_all(artifact.to_json_string()?.as_bytes())?;
            drop(writer);
            println!("{}", serde_json::to_string_pretty(&artifact.metadata)?);
        }
        Commands::Resolve { new_key } => {
            let store = open_store(&cli, &config)?;
            if let Some(metadata) = run_diff(store.as_ref(), &config, new_key)? {
                println!("{}", serde_json::to_string_pretty(&metadata)?);
            }
        }
        Commands::Load { key } => {
            let store = open_store(&cli, &config)?;
            let client = EsClient::new(&config.es_endpoint);
            let indexed = load_diff_from_store(store.as_ref(), &config, &client, key)?;
            println!("indexed {} documents from {}", indexed, key);
        }
        Commands::Backfill {
            date_min,
            date_max,
            max_files,
        } => {
            let store = open_store(&cli, &config)?;
            let client = EsClient::new(&config.es_endpoint);
            let date_min = (*date_min).or(config.start_date);
            let indexed = backfill(
                store.as_ref(),
                &config,
                &client,
                date_min,
                *date_max,
                *max_files,
            )?;
            println!("indexed {} documents", indexed);
        }
    }
    Ok(())
}
