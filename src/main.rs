// src/main.rs

// -----------------------------------------------------------------------------
// trace-stats - fetch, decompress and analyze agent chat traces
// -----------------------------------------------------------------------------

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Builder as RtBuilder;
use tracing::{debug, info};

use agent_trace_stats::config::PipelineConfig;
use agent_trace_stats::decompress::{run_decompress, DecompressOptions};
use agent_trace_stats::distribution::{run_distribution, DistributionOptions};
use agent_trace_stats::extract::{run_extract, ExtractOptions, Role};
use agent_trace_stats::fetch::{run_fetch, FetchOptions};
use agent_trace_stats::identifier::IdShape;
use agent_trace_stats::prompt_stats::{run_analyze, AnalyzeOptions};
use agent_trace_stats::store::{ObjectStore, S3Store};
use agent_trace_stats::tokenizer::TokenizerKind;
use agent_trace_stats::PipelineError;

// -----------------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------------
#[derive(Parser)]
#[command(name = "trace-stats", version, about = "Fetch, decompress and analyze agent chat traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace with AWS SDK debug)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// YAML file with per-stage defaults; flags on the command line win
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the latest .gz trace for every id in a CSV
    ///
    /// Examples:
    ///   trace-stats fetch --csv-path ids.csv --download-root data/gz
    ///   trace-stats fetch --csv-path ids.csv --download-root data/gz --bucket-name traces --max-threads 64
    Fetch {
        #[arg(long)]
        csv_path: PathBuf,
        #[arg(long)]
        id_column: Option<String>,
        #[arg(long)]
        download_root: PathBuf,
        #[arg(long)]
        bucket_name: Option<String>,
        #[arg(long)]
        region_name: Option<String>,
        #[arg(long)]
        max_threads: Option<usize>,
        /// Only keys ending in this suffix are considered
        #[arg(long)]
        suffix: Option<String>,
        /// Where to list ids without a download (default: missing_ids.txt next to the download root)
        #[arg(long)]
        missing_out: Option<PathBuf>,
        /// Timeout for a single LIST or GET attempt
        #[arg(long)]
        op_timeout_secs: Option<u64>,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Decompress every .gz under a directory next to itself
    ///
    /// Examples:
    ///   trace-stats decompress --download-root data/gz
    Decompress {
        #[arg(long)]
        download_root: PathBuf,
        #[arg(long)]
        max_threads: Option<usize>,
        #[arg(long)]
        suffix: Option<String>,
    },
    /// Join ids found on disk with agent metadata and print distributions
    ///
    /// Examples:
    ///   trace-stats distribution --data-root data/gz --csv-path meta.csv
    ///   trace-stats distribution --data-root data/gz --csv-path exports/ --json
    Distribution {
        #[arg(long)]
        data_root: PathBuf,
        /// Metadata CSV file or directory of CSVs (repeatable)
        #[arg(long = "csv-path")]
        csv_paths: Vec<PathBuf>,
        #[arg(long)]
        id_pattern: Option<String>,
        /// Write every unmatched id to this file
        #[arg(long)]
        unmatched_out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Extract user/assistant messages from JSON traces into a CSV
    ///
    /// Examples:
    ///   trace-stats extract --json-root data/gz --output-csv prompts.csv
    ///   trace-stats extract --json-root data/gz --output-csv prompts.csv --file-glob "*_chat_completion.json"
    Extract {
        #[arg(long)]
        json_root: PathBuf,
        #[arg(long)]
        output_csv: PathBuf,
        #[arg(long)]
        file_glob: Option<String>,
        #[arg(long)]
        id_pattern: Option<String>,
        /// Roles whose messages are classified as tool calls
        #[arg(long, value_enum, value_delimiter = ',')]
        tool_call_roles: Option<Vec<Role>>,
        #[arg(long)]
        max_threads: Option<usize>,
    },
    /// Token and tool-call statistics over an extracted prompts CSV
    ///
    /// Examples:
    ///   trace-stats analyze --csv-path prompts.csv
    ///   trace-stats analyze --csv-path prompts.csv --tokenizer whitespace --json
    ///   trace-stats analyze --csv-path prompts.csv --export-tsv conversations.tsv
    Analyze {
        #[arg(long)]
        csv_path: PathBuf,
        #[arg(long, value_enum)]
        tokenizer: Option<TokenizerKind>,
        #[arg(long)]
        top_n: Option<usize>,
        #[arg(long)]
        focus_tool_type: Option<String>,
        #[arg(long)]
        json: bool,
        /// Write per-conversation statistics as TSV
        #[arg(long)]
        export_tsv: Option<PathBuf>,
    },
}

// -----------------------------------------------------------------------------
// main
// -----------------------------------------------------------------------------
fn main() -> Result<()> {
    let cli = Cli::parse();

    // -v (1): info, -vv (2): debug (+ AWS SDK info), -vvv: trace (+ AWS SDK debug)
    let (app_level, aws_level) = match cli.verbose {
        0 => ("warn", "warn"),
        1 => ("info", "warn"),
        2 => ("debug", "info"),
        _ => ("trace", "debug"),
    };

    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::new(format!(
        "agent_trace_stats={},trace_stats={},aws_config={},aws_sdk_s3={},aws_smithy_runtime={}",
        app_level, app_level, aws_level, aws_level, aws_level
    ));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    // AWS credentials / endpoint may come from a .env file
    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded environment from {}", path.display());
    }

    let cfg = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch {
            csv_path,
            id_column,
            download_root,
            bucket_name,
            region_name,
            max_threads,
            suffix,
            missing_out,
            op_timeout_secs,
            max_retries,
        } => {
            let mut opts = FetchOptions::new(csv_path, download_root);
            opts.id_column = id_column.unwrap_or(cfg.fetch.id_column);
            opts.bucket_name = bucket_name.unwrap_or(cfg.fetch.bucket_name);
            opts.region_name = region_name.unwrap_or(cfg.fetch.region_name);
            opts.max_threads = positive("--max-threads", max_threads.unwrap_or(cfg.fetch.max_threads))?;
            opts.suffix = suffix.unwrap_or(cfg.fetch.suffix);
            opts.missing_out = missing_out.or(cfg.fetch.missing_out);
            opts.retry = cfg.retry;
            if let Some(secs) = op_timeout_secs {
                opts.retry.attempt_timeout = Some(Duration::from_secs(secs));
            }
            if let Some(n) = max_retries {
                opts.retry.max_retries = n;
            }
            fetch_cmd(opts)
        }
        Commands::Decompress { download_root, max_threads, suffix } => {
            let mut opts = DecompressOptions::new(download_root);
            opts.max_threads = positive("--max-threads", max_threads.unwrap_or(cfg.decompress.max_threads))?;
            opts.suffix = suffix.unwrap_or(cfg.decompress.suffix);
            decompress_cmd(opts)
        }
        Commands::Distribution { data_root, csv_paths, id_pattern, unmatched_out, json } => {
            let csv_paths = if csv_paths.is_empty() { cfg.distribution.csv_paths } else { csv_paths };
            if csv_paths.is_empty() {
                return Err(PipelineError::config("at least one --csv-path is required").into());
            }
            let opts = DistributionOptions {
                data_root,
                csv_paths,
                id_shape: id_shape(id_pattern.as_deref().unwrap_or(&cfg.id_pattern))?,
                unmatched_out: unmatched_out.or(cfg.distribution.unmatched_out),
            };
            distribution_cmd(opts, json)
        }
        Commands::Extract { json_root, output_csv, file_glob, id_pattern, tool_call_roles, max_threads } => {
            let mut opts = ExtractOptions::new(json_root, output_csv);
            opts.file_glob = file_glob.unwrap_or(cfg.extract.file_glob);
            opts.id_shape = id_shape(id_pattern.as_deref().unwrap_or(&cfg.id_pattern))?;
            opts.tool_call_roles = tool_call_roles.unwrap_or(cfg.extract.tool_call_roles);
            opts.max_threads = positive("--max-threads", max_threads.unwrap_or(cfg.extract.max_threads))?;
            extract_cmd(opts)
        }
        Commands::Analyze { csv_path, tokenizer, top_n, focus_tool_type, json, export_tsv } => {
            let mut opts = AnalyzeOptions::new(csv_path);
            opts.tokenizer = tokenizer.unwrap_or(cfg.analyze.tokenizer);
            opts.top_n = positive("--top-n", top_n.unwrap_or(cfg.analyze.top_n))?;
            opts.focus_tool_type = focus_tool_type.unwrap_or(cfg.analyze.focus_tool_type);
            opts.export_tsv = export_tsv;
            analyze_cmd(opts, json)
        }
    }
}

fn positive(flag: &str, n: usize) -> Result<usize> {
    if n == 0 {
        return Err(PipelineError::config(format!("{} must be at least 1", flag)).into());
    }
    Ok(n)
}

fn id_shape(pattern: &str) -> Result<IdShape> {
    IdShape::new(pattern).map_err(|e| PipelineError::config(format!("{:#}", e)).into())
}

// -----------------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------------
fn fetch_cmd(opts: FetchOptions) -> Result<()> {
    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    let report = rt.block_on(async {
        let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&opts.bucket_name, &opts.region_name).await?);
        run_fetch(store, &opts).await
    })?;
    report.print_summary();
    report.tracker.ensure_progress()?;
    Ok(())
}

fn decompress_cmd(opts: DecompressOptions) -> Result<()> {
    let report = run_decompress(&opts)?;
    report.print_summary();
    report.tracker.ensure_progress()?;
    Ok(())
}

fn distribution_cmd(opts: DistributionOptions, json: bool) -> Result<()> {
    let report = run_distribution(&opts)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report).context("Failed to serialize report")?);
    } else {
        print!("{}", report.format_text());
    }
    Ok(())
}

fn extract_cmd(opts: ExtractOptions) -> Result<()> {
    let report = run_extract(&opts)?;
    report.print_summary();
    report.tracker.ensure_progress()?;
    Ok(())
}

fn analyze_cmd(opts: AnalyzeOptions, json: bool) -> Result<()> {
    let analysis = run_analyze(&opts)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&analysis).context("Failed to serialize analysis")?);
    } else {
        print!("{}", analysis.format_text());
    }
    if let (Some(path), false) = (&opts.export_tsv, json) {
        println!("\nPer-conversation TSV exported to: {}", path.display());
    }
    info!("Analyzed {} rows in {} conversations", analysis.rows, analysis.conversation_count);
    Ok(())
}
