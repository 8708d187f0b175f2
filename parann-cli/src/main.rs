use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parann::{
    compute_groundtruth, compute_groundtruth_with_removal, write_ibin, write_removal_rounds,
    ClusterCollection, Coordinate, KMeansClusterer, KMeansConfig, KMeansReport, Metric,
    PointRange,
};

const MAIN_HELP: &str = "\
EXAMPLES:
    # Exact 100 nearest neighbors of every query
    parann groundtruth --base-path base.fbin --query-path query.fbin \\
        --data-type float --dist-func Euclidian --gt-path gt.ibin

    # One groundtruth file per removal round (gt_0, gt_1, ...)
    parann groundtruth --base-path base.u8bin --query-path query.u8bin \\
        --data-type uint8 --dist-func Euclidian -k 10 \\
        --gt-path gt_ --with-rm --interval-sz 100000

    # K-means buckets over a whole point file
    parann cluster --base-path base.i8bin --data-type int8 --dist-func mips \\
        --n-clusters 64 --output buckets.json

    # First rows of a file and of the view after dropping 1000 points
    parann inspect --base-path base.fbin --data-type float --slice 1000

POINT FILES:
    u32 point count, u32 dimension, then row-major coordinates
    (.fbin: f32, .u8bin: u8, .i8bin: i8), little endian.

ENVIRONMENT:
    RUST_LOG controls log output (default: parann=info)";

#[derive(Parser)]
#[command(
    name = "parann",
    version,
    about = "Exact groundtruth and clustering for ANN benchmark point files",
    after_help = MAIN_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute exact k-nearest-neighbor groundtruth and write it as .ibin
    Groundtruth(GroundtruthArgs),

    /// Cluster a point file into k-means buckets and write them as JSON
    Cluster(ClusterArgs),

    /// Print the size, dimension and first rows of a point file
    Inspect(InspectArgs),
}

/// Coordinate type of a point file.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum DataType {
    Float,
    Uint8,
    Int8,
}

#[derive(Args)]
struct GroundtruthArgs {
    /// Base point file
    #[arg(long)]
    base_path: PathBuf,

    /// Query point file
    #[arg(long)]
    query_path: PathBuf,

    /// Coordinate type of both files
    #[arg(long, value_enum)]
    data_type: DataType,

    /// Distance function (Euclidian or mips)
    #[arg(long)]
    dist_func: Metric,

    /// Number of neighbors per query
    #[arg(short = 'k', long, default_value_t = 100)]
    k: usize,

    /// Output file, or file prefix with --with-rm
    #[arg(long)]
    gt_path: PathBuf,

    /// Recompute the groundtruth after removing every interval of base points
    #[arg(long)]
    with_rm: bool,

    /// Number of base points removed per round
    #[arg(long, default_value_t = 1)]
    interval_sz: usize,
}

#[derive(Args)]
struct ClusterArgs {
    /// Point file to cluster
    #[arg(long)]
    base_path: PathBuf,

    /// Coordinate type of the file
    #[arg(long, value_enum)]
    data_type: DataType,

    /// Distance function (Euclidian or mips)
    #[arg(long)]
    dist_func: Metric,

    /// Number of buckets
    #[arg(long, default_value_t = 1000)]
    n_clusters: usize,

    /// Maximum number of refinement passes
    #[arg(long, default_value_t = 100)]
    max_iterations: usize,

    /// Seed of the initial partition clustering
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// JSON output file
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args)]
struct InspectArgs {
    /// Point file to read
    #[arg(long)]
    base_path: PathBuf,

    /// Coordinate type of the file
    #[arg(long, value_enum)]
    data_type: DataType,

    /// Distance function attached to the loaded points
    #[arg(long, default_value = "Euclidian")]
    dist_func: Metric,

    /// Number of rows to print
    #[arg(long, default_value_t = 5)]
    rows: usize,

    /// Also print the view that starts at this point
    #[arg(long)]
    slice: Option<usize>,
}

/// A command that runs over points of any coordinate type.
trait PointCommand {
    fn run<T: Coordinate>(&self) -> Result<()>;
}

fn dispatch<C: PointCommand>(data_type: DataType, command: &C) -> Result<()> {
    match data_type {
        DataType::Float => command.run::<f32>(),
        DataType::Uint8 => command.run::<u8>(),
        DataType::Int8 => command.run::<i8>(),
    }
}

fn load_points<T: Coordinate>(path: &Path, metric: Metric) -> Result<PointRange<T>> {
    PointRange::load(path, metric).with_context(|| {
        format!(
            "Failed to load {} points from {}",
            T::NAME,
            path.display()
        )
    })
}

impl PointCommand for GroundtruthArgs {
    fn run<T: Coordinate>(&self) -> Result<()> {
        let base = load_points::<T>(&self.base_path, self.dist_func)?;
        let queries = load_points::<T>(&self.query_path, self.dist_func)?;
        println!(
            "{} base points, {} queries, dimension {}, {} distance",
            base.len(),
            queries.len(),
            base.dimension(),
            self.dist_func
        );

        let start = Instant::now();
        if self.with_rm {
            let mut rounds =
                compute_groundtruth_with_removal(&base, &queries, self.interval_sz, self.k)?;
            let paths = write_removal_rounds(&self.gt_path, &mut rounds, self.k)
                .with_context(|| {
                    format!("Failed to write groundtruth rounds to {}*", self.gt_path.display())
                })?;
            println!(
                "{} Wrote {} removal rounds to {}* {}",
                "✓".green(),
                paths.len(),
                self.gt_path.display(),
                format!("({:.2?})", start.elapsed()).dimmed()
            );
        } else {
            let mut groundtruth = compute_groundtruth(&base, &queries, self.k)?;
            write_ibin(&self.gt_path, &mut groundtruth, self.k).with_context(|| {
                format!("Failed to write groundtruth to {}", self.gt_path.display())
            })?;
            println!(
                "{} Wrote groundtruth to {} {}",
                "✓".green(),
                self.gt_path.display(),
                format!("({:.2?})", start.elapsed()).dimmed()
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ClusterOutput<'a> {
    data_type: &'static str,
    metric: Metric,
    points: usize,
    dimension: usize,
    report: &'a KMeansReport,
    buckets: &'a ClusterCollection,
}

impl PointCommand for ClusterArgs {
    fn run<T: Coordinate>(&self) -> Result<()> {
        let points = load_points::<T>(&self.base_path, self.dist_func)?;

        let config = KMeansConfig::with_n_clusters(self.n_clusters)
            .max_iterations(self.max_iterations)
            .seed(self.seed);
        let start = Instant::now();
        let (buckets, report) =
            KMeansClusterer::new(config).cluster_with_report(&points, &points.all_ids())?;
        let elapsed = start.elapsed();

        let output = ClusterOutput {
            data_type: T::NAME,
            metric: points.metric(),
            points: points.len(),
            dimension: points.dimension(),
            report: &report,
            buckets: &buckets,
        };
        let file = File::create(&self.output)
            .with_context(|| format!("Failed to create {}", self.output.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &output)?;
        writer.flush()?;

        let status = if report.converged {
            "converged".green()
        } else {
            "not converged".yellow()
        };
        println!(
            "{} {} buckets over {} points, {} after {} passes {}",
            "✓".green(),
            buckets.len(),
            points.len(),
            status,
            report.iterations,
            format!("({:.2?})", elapsed).dimmed()
        );
        if let Some(cost) = report.cost_history.last() {
            println!("   final cost {}", format!("{cost:.4}").bold());
        }
        println!("   written to {}", self.output.display());
        Ok(())
    }
}

fn print_rows<T: Coordinate>(points: &PointRange<T>, rows: usize) {
    for point in points.iter().take(rows) {
        println!(
            "   {} {:?}",
            format!("{}.", points.offset() + point.id() as usize).dimmed(),
            point.coordinates()
        );
    }
    if points.len() > rows {
        println!("   {}", format!("... {} more", points.len() - rows).dimmed());
    }
}

impl PointCommand for InspectArgs {
    fn run<T: Coordinate>(&self) -> Result<()> {
        let points = load_points::<T>(&self.base_path, self.dist_func)?;
        println!(
            "{}: {} {} points of dimension {}",
            self.base_path.display().to_string().bold(),
            points.len(),
            T::NAME,
            points.dimension()
        );
        print_rows(&points, self.rows);

        if let Some(offset) = self.slice {
            let view = points.get_slice(offset);
            println!(
                "{}: {} points",
                format!("slice from {offset}").bold(),
                view.len()
            );
            print_rows(&view, self.rows);
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parann=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Groundtruth(args) => dispatch(args.data_type, &args),
        Commands::Cluster(args) => dispatch(args.data_type, &args),
        Commands::Inspect(args) => dispatch(args.data_type, &args),
    }
}
