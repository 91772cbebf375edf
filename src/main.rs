//! Command-line plot builder.
//!
//! ```bash
//! plotforge -k 26 -i <64-hex-char id> -f plot-k26.dat -t /mnt/scratch -d /mnt/plots
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use plotforge::disk::RetryPolicy;
use plotforge::plotter::{DiskPlotter, PlotConfig};
use plotforge::pos::ID_LEN;

#[derive(Parser, Debug)]
#[command(
    name = "plotforge",
    version,
    about = "Build a proof-of-space plot file on disk"
)]
struct Cli {
    /// Plot size exponent (18..=50).
    #[arg(short = 'k', long = "size")]
    k: u32,

    /// 32-byte plot id, hex encoded.
    #[arg(short = 'i', long = "id")]
    id: String,

    /// Arbitrary memo, hex encoded.
    #[arg(short = 'm', long = "memo", default_value = "")]
    memo: String,

    /// Output file name.
    #[arg(short = 'f', long = "file")]
    filename: String,

    /// First temporary directory (bucket files and table streams).
    #[arg(short = 't', long = "tempdir", default_value = ".")]
    tmp_dir: PathBuf,

    /// Second temporary directory (the in-progress final file); defaults
    /// to the first.
    #[arg(short = '2', long = "tempdir2")]
    tmp2_dir: Option<PathBuf>,

    /// Directory the finished plot lands in.
    #[arg(short = 'd', long = "finaldir", default_value = ".")]
    final_dir: PathBuf,

    /// Working buffer in MiB (0 = default).
    #[arg(short = 'b', long = "buffer", default_value_t = 0)]
    memory_mib: u32,

    /// Number of sort buckets, a power of two (0 = computed).
    #[arg(short = 'u', long = "buckets", default_value_t = 0)]
    num_buckets: u32,

    /// Matching stripe size in entries (0 = default 65536).
    #[arg(short = 's', long = "stripes", default_value_t = 0)]
    stripe_size: u64,

    /// Worker threads for the matching pass (0 = default 2).
    #[arg(short = 'r', long = "threads", default_value_t = 0)]
    num_threads: usize,

    /// Request the legacy non-bitfield pipeline (not available).
    #[arg(long = "nobitfield")]
    nobitfield: bool,
}

fn parse_id(hex_id: &str) -> Result<[u8; ID_LEN], String> {
    let bytes = hex::decode(hex_id).map_err(|e| format!("id is not valid hex: {e}"))?;
    let mut id = [0u8; ID_LEN];
    if bytes.len() != ID_LEN {
        return Err(format!("id must be {ID_LEN} bytes, got {}", bytes.len()));
    }
    id.copy_from_slice(&bytes);
    Ok(id)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let id = match parse_id(&cli.id) {
        Ok(id) => id,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let memo = match hex::decode(&cli.memo) {
        Ok(m) => m,
        Err(e) => {
            error!("memo is not valid hex: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = PlotConfig {
        k: cli.k,
        id,
        memo,
        tmp_dir: cli.tmp_dir.clone(),
        tmp2_dir: cli.tmp2_dir.unwrap_or(cli.tmp_dir),
        final_dir: cli.final_dir,
        filename: cli.filename,
        memory_mib: cli.memory_mib,
        num_buckets: cli.num_buckets,
        stripe_size: cli.stripe_size,
        num_threads: cli.num_threads,
        disable_bitfield: cli.nobitfield,
        retry: RetryPolicy::default(),
    };

    let plotter = match DiskPlotter::new(config) {
        Ok(p) => p,
        Err(e) => {
            error!("configuration rejected: {e}");
            return ExitCode::FAILURE;
        }
    };

    let progress = |phase: u8, n: u64, max_n: u64| {
        let percent = 25.0 * (f64::from(phase) - 1.0 + n as f64 / max_n as f64);
        info!("progress: {percent:.1}%");
    };

    match plotter.create_plot(&progress) {
        Ok(summary) => {
            info!(
                path = %summary.final_path.display(),
                size = summary.final_size,
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("plotting failed: {e}");
            ExitCode::FAILURE
        }
    }
}
