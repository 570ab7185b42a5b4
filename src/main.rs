//! rust_memento command-line interface

use clap::Parser;
use log::{info, LevelFilter};

use rust_memento::cli::{Cli, Commands, InputArgs};
use rust_memento::prelude::*;

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    if cli.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()
            .ok();
    }

    let result = match cli.command {
        Commands::Moments {
            input,
            pairs,
            summary_column,
            summary,
            pair_summary,
            output,
            format,
        } => run_moments(
            &input,
            pairs.as_deref(),
            summary_column.as_deref(),
            summary.as_deref(),
            pair_summary.as_deref(),
            &output,
            format,
        ),
        Commands::Test1d {
            input,
            test,
            output,
            format,
        } => run_test_1d(&input, &test.formula, &test.covariate, &test.test_params(), test.alpha, &output, format),
        Commands::Test2d {
            input,
            test,
            pairs,
            output,
            format,
        } => run_test_2d(
            &input,
            &test.formula,
            &test.covariate,
            &pairs,
            &test.test_params(),
            test.alpha,
            &output,
            format,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Load the data, build the groups and compute size factors and 1D moments
fn prepare_store(input: &InputArgs) -> Result<GroupStore> {
    info!("Loading count matrix from: {}", input.counts);
    let counts = read_count_matrix(&input.counts)?;

    info!("Loading metadata from: {}", input.metadata);
    let metadata = read_metadata(&input.metadata)?;
    let dataset = Dataset::new(counts, metadata)?;

    let store = prepare_groups(
        &dataset,
        &input.labels,
        input.q_column.as_deref(),
        input.noise_model,
        &input.size_factor_params(),
        &input.moment_params(),
    )?;
    info!(
        "{} groups over {} cells with the {} model",
        store.groups().len(),
        dataset.n_cells(),
        store.noise_model()
    );
    info!("{} genes retained after filtering", store.n_genes());
    Ok(store)
}

#[allow(clippy::too_many_arguments)]
fn run_moments(
    input: &InputArgs,
    pairs_path: Option<&str>,
    summary_column: Option<&str>,
    summary_path: Option<&str>,
    pair_summary_path: Option<&str>,
    output: &str,
    format: OutputFormat,
) -> Result<()> {
    let mut store = prepare_store(input)?;

    if let Some(path) = pairs_path {
        let names = read_gene_pairs(path)?;
        let pairs = store.resolve_gene_pairs(&names)?;
        compute_2d_moments(&mut store, &pairs)?;
    }

    let table = moment_table(&store);
    write_table(output, &table, format)?;
    info!("Wrote {} moment records to: {}", table.len(), output);

    if let (Some(column), Some(path)) = (summary_column, summary_path) {
        let summary = summarize_1d_moments(&store, column)?;
        write_table(path, &summary, format)?;
        info!("Wrote moment summary over '{}' to: {}", column, path);
    }

    if let (Some(column), Some(path)) = (summary_column, pair_summary_path) {
        let summary = summarize_2d_moments(&store, column)?;
        write_table(path, &summary, format)?;
        info!("Wrote pair correlation summary over '{}' to: {}", column, path);
    }
    Ok(())
}

fn run_test_1d(
    input: &InputArgs,
    formula: &str,
    covariate: &str,
    params: &TestParams,
    alpha: f64,
    output: &str,
    format: OutputFormat,
) -> Result<()> {
    let store = prepare_store(input)?;
    let design = build_design_matrix(&store, formula, covariate)?;
    let results = test_1d(&store, &design, params)?;

    write_table(output, &results, format)?;
    info!("Results written to: {}", output);
    for summary in TestSummary::one_d(&results, alpha) {
        println!("{}", summary);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_test_2d(
    input: &InputArgs,
    formula: &str,
    covariate: &str,
    pairs_path: &str,
    params: &TestParams,
    alpha: f64,
    output: &str,
    format: OutputFormat,
) -> Result<()> {
    let store = prepare_store(input)?;
    let names = read_gene_pairs(pairs_path)?;
    let pairs = store.resolve_gene_pairs(&names)?;
    let design = build_design_matrix(&store, formula, covariate)?;
    let results = test_2d(&store, &design, &pairs, params)?;

    write_table(output, &results, format)?;
    info!("Results written to: {}", output);
    println!("{}", TestSummary::two_d(&results, alpha));
    Ok(())
}
