mod fvecs;

use clap::{Parser, Subcommand};
use rpforest_core::config::DEFAULT_SEED;
use rpforest_core::storage::IndexImage;
use rpforest_core::{verify_index_file, AnnIndex, Header, IndexConfig, Metric};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rpforest",
    about = "Build and query random-projection forest ANN indexes"
)]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an index from a vector file (u32 count, u32 dim, f32 data)
    Build {
        /// Input vector file
        #[arg(short, long)]
        input: PathBuf,

        /// Output index file
        #[arg(short, long, env = "RPFOREST_INDEX")]
        output: PathBuf,

        /// Distance metric: angular or euclidean
        #[arg(short, long, default_value = "angular")]
        metric: Metric,

        /// Number of trees
        #[arg(short = 't', long, default_value_t = 10)]
        trees: usize,

        /// Maximum items per leaf (default: dimension + 3)
        #[arg(long)]
        bucket_size: Option<usize>,

        /// Seed for tree construction
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u64,

        /// Build threads (0 = all cores)
        #[arg(long, default_value_t = 0)]
        threads: usize,

        /// Log build progress at info level
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },

    /// Query an index by item id or by vector
    Query {
        /// Index file
        #[arg(short, long, env = "RPFOREST_INDEX")]
        index: PathBuf,

        /// Item id to search around
        #[arg(long, conflicts_with = "vector", required_unless_present = "vector")]
        item: Option<u32>,

        /// Comma-separated query vector
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        vector: Option<Vec<f32>>,

        /// Number of neighbors
        #[arg(short, default_value_t = 10)]
        n: usize,

        /// Candidates to gather before ranking (default: n * trees)
        #[arg(short = 'k', long, env = "RPFOREST_SEARCH_K")]
        search_k: Option<usize>,
    },

    /// Print the header of an index file as JSON
    Info {
        #[arg(short, long, env = "RPFOREST_INDEX")]
        index: PathBuf,
    },

    /// Check an index file, including its body checksum
    Verify {
        #[arg(short, long, env = "RPFOREST_INDEX")]
        index: PathBuf,
    },
}

#[derive(Serialize)]
struct InfoReport {
    path: PathBuf,
    bytes: usize,
    mapped: bool,
    header: Header,
}

#[derive(Serialize)]
struct VerifyReport {
    path: PathBuf,
    ok: bool,
    header: Header,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::from_default_env()
        .add_directive("rpforest=info".parse().expect("valid directive literal"))
        .add_directive(
            "rpforest_core=info"
                .parse()
                .expect("valid directive literal"),
        );
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json);

    match args.command {
        Command::Build {
            input,
            output,
            metric,
            trees,
            bucket_size,
            seed,
            threads,
            verbose,
        } => {
            let t0 = Instant::now();
            let vectors = fvecs::read_vectors(&input)?;
            tracing::info!(
                "Read {} vectors x {}d from {:?} in {:.2}s",
                vectors.len(),
                vectors.dimension,
                input,
                t0.elapsed().as_secs_f64()
            );

            let mut index = AnnIndex::with_config(IndexConfig {
                dimension: vectors.dimension,
                metric,
                bucket_size,
                seed,
                build_threads: threads,
            })?;
            index.verbose(verbose);
            for (id, row) in vectors.rows().enumerate() {
                let id = u32::try_from(id)?;
                index.add_item(id, row)?;
            }

            let t0 = Instant::now();
            index.build(trees)?;
            index.save(&output)?;
            tracing::info!(
                "Built {} trees ({} nodes) and saved {:?} in {:.2}s",
                index.get_n_trees(),
                index.node_count(),
                output,
                t0.elapsed().as_secs_f64()
            );
        }

        Command::Query {
            index,
            item,
            vector,
            n,
            search_k,
        } => {
            let ann = AnnIndex::open(&index)?;
            let results = match (item, vector) {
                (Some(id), _) => ann.get_nns_by_item(id, n, search_k)?,
                (None, Some(query)) => ann.get_nns_by_vector(&query, n, search_k)?,
                (None, None) => return Err("either --item or --vector is required".into()),
            };
            print_json(&results)?;
        }

        Command::Info { index } => {
            let image = IndexImage::load(&index)?;
            print_json(&InfoReport {
                bytes: image.byte_len(),
                mapped: image.is_mapped(),
                header: *image.header(),
                path: index,
            })?;
        }

        Command::Verify { index } => {
            let header = verify_index_file(&index)?;
            print_json(&VerifyReport {
                path: index,
                ok: true,
                header,
            })?;
        }
    }

    Ok(())
}
