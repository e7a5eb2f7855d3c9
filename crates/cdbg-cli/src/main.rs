use anyhow::Context;
use cdbg_lib::blocked::build_blocked_index;
use cdbg_lib::{
    build_index, build_mst_for_index, merge_msts, remove_color_class_files, BuildConfig,
    ColoredIndex, Kmer, MstDecoder, SampleSource,
};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "cdbg")]
#[command(version = "0.1.0")]
#[command(about = "Compressed, queryable colored de Bruijn graph index", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an index from per-sample filters
    Build {
        /// List file naming one per-sample filter per line
        #[arg(short, long)]
        input_list: PathBuf,

        /// Output index directory
        #[arg(short, long)]
        output: PathBuf,

        /// K-mer length
        #[arg(short, long)]
        kmer_len: u64,

        /// log2 of the initial slot count of the main filter
        #[arg(short, long, default_value = "20")]
        qbits: u64,

        /// Number of threads for the MST stages
        #[arg(short = 't', long, default_value = "1")]
        threads: usize,

        /// K-mers consumed by the sampling phase
        #[arg(long)]
        sample_size: Option<u64>,

        /// Bit budget of one bitmap buffer
        #[arg(long)]
        buffer_bits: Option<u64>,

        /// Dump (color id, abundance) pairs next to the index
        #[arg(long, default_value = "false")]
        eqclass_dist: bool,

        /// Build minimizer-blocked filters instead of one flat filter
        #[arg(long, default_value = "false")]
        blocked: bool,
    },

    /// Build the spanning-tree color encoding for an existing index
    Mst {
        /// Index directory
        #[arg(short, long)]
        index: PathBuf,

        /// Number of threads
        #[arg(short = 't', long, default_value = "1")]
        threads: usize,

        /// Remove the raw bitmap sidecars once the encoding is written
        #[arg(long, default_value = "false")]
        delete_eqclasses: bool,
    },

    /// Merge the spanning trees of two indices over a pair index
    Merge {
        /// Output directory holding the pair filter and newID2oldIDs
        #[arg(short, long)]
        output: PathBuf,

        /// First source index directory
        #[arg(long)]
        first: PathBuf,

        /// Second source index directory
        #[arg(long)]
        second: PathBuf,

        /// Number of threads
        #[arg(short = 't', long, default_value = "1")]
        threads: usize,
    },

    /// Query an index with a file of k-mers, one per line
    Query {
        /// Index directory
        #[arg(short, long)]
        index: PathBuf,

        /// Query file with one DNA k-mer per line
        #[arg(short, long)]
        queries: PathBuf,

        /// Resolve colors through the spanning-tree encoding
        #[arg(long, default_value = "false")]
        use_mst: bool,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing: use RUST_LOG if set, otherwise default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input_list,
            output,
            kmer_len,
            qbits,
            threads,
            sample_size,
            buffer_bits,
            eqclass_dist,
            blocked,
        } => {
            let sources = SampleSource::open_list(&input_list)
                .with_context(|| format!("opening input list {}", input_list.display()))?;
            info!(samples = sources.len(), k = kmer_len, "building index");

            let mut config = BuildConfig {
                kmer_len,
                qbits,
                num_threads: threads,
                dump_eqclass_dist: eqclass_dist,
                ..BuildConfig::default()
            };
            if let Some(sample_size) = sample_size {
                config.sample_size = sample_size;
            }
            if let Some(buffer_bits) = buffer_bits {
                config.bv_buf_len = buffer_bits;
            }

            if blocked {
                let builder = build_blocked_index(config, &sources, &output)?;
                info!(
                    color_classes = builder.num_color_classes(),
                    blocks = builder.num_blocks(),
                    "blocked build complete"
                );
            } else {
                let builder = build_index(config, &sources, &output)?;
                info!(
                    color_classes = builder.num_color_classes(),
                    "build complete"
                );
            }
        }

        Commands::Mst { index, threads, delete_eqclasses } => {
            let artifacts = build_mst_for_index(&index, threads)?;
            info!(
                nodes = artifacts.num_nodes,
                total_weight = artifacts.total_weight,
                "spanning-tree encoding complete"
            );
            if delete_eqclasses {
                remove_color_class_files(&index)?;
            }
        }

        Commands::Merge { output, first, second, threads } => {
            let artifacts = merge_msts(&output, &first, &second, threads)?;
            info!(
                nodes = artifacts.num_nodes,
                total_weight = artifacts.total_weight,
                "merge complete"
            );
        }

        Commands::Query { index, queries, use_mst } => {
            query_command(&index, &queries, use_mst)?;
        }
    }

    Ok(())
}

fn query_command(index_dir: &PathBuf, queries: &PathBuf, use_mst: bool) -> anyhow::Result<()> {
    let index = ColoredIndex::open(index_dir)?;
    let k = index.kmer_len() as usize;

    let file = File::open(queries)
        .with_context(|| format!("opening query file {}", queries.display()))?;
    let mut kmers = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.len() != k {
            anyhow::bail!(
                "query line {}: expected a {k}-mer, got {} bases",
                lineno + 1,
                line.len()
            );
        }
        kmers.push(Kmer::from_str(line)?);
    }
    info!(kmers = kmers.len(), "querying index");

    let counts = if use_mst {
        if !index.has_mst() {
            anyhow::bail!(
                "index {} has no spanning-tree encoding; run `cdbg mst` first",
                index_dir.display()
            );
        }
        let decoder = MstDecoder::open(index_dir)?;
        index.find_samples_mst(&kmers, &decoder)
    } else {
        index.find_samples(&kmers)?
    };

    for (name, count) in index.sample_names().iter().zip(&counts) {
        println!("{name}\t{count}");
    }
    Ok(())
}
