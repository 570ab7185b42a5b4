//! Command-line interface for rust_memento

use clap::{Args, Parser, Subcommand};

use crate::bootstrap::BootstrapParams;
use crate::io::OutputFormat;
use crate::moments::{MomentParams, NoiseModel};
use crate::normalization::SizeFactorParams;
use crate::testing::{AslParams, TestParams};

#[derive(Parser)]
#[command(name = "rust_memento")]
#[command(version)]
#[command(about = "Moment estimation and bootstrap hypothesis testing for single-cell counts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Number of threads (0 = auto)
    #[arg(short = 't', long, global = true, default_value = "0")]
    pub threads: usize,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Estimate per-group moments and write the flat moment table
    #[command(after_long_help = "\
Examples:
  rust_memento moments -c counts.csv -m cells.csv -l stim -l ind --q-column q -o moments.csv
  rust_memento moments -c counts.csv -m cells.csv -l stim --summary-column stim --summary summary.csv
  rust_memento moments -c counts.csv -m cells.csv -l stim --pairs pairs.csv --summary-column stim \\
    --summary summary.csv --pair-summary pair_summary.csv")]
    Moments {
        #[command(flatten)]
        input: InputArgs,

        /// Gene pairs file for covariance and correlation (header + two columns)
        #[arg(long)]
        pairs: Option<String>,

        /// Metadata column to summarize log moments over
        #[arg(long, requires = "summary")]
        summary_column: Option<String>,

        /// Output path for the per-level summary
        #[arg(long)]
        summary: Option<String>,

        /// Output path for the per-level pair correlation summary
        #[arg(long, requires_all = ["summary_column", "pairs"])]
        pair_summary: Option<String>,

        /// Output file path
        #[arg(short, long, default_value = "memento_moments.csv")]
        output: String,

        /// Output format (csv or json)
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Test every gene for differential mean and variability
    #[command(name = "test-1d", after_long_help = "\
Examples:
  rust_memento test-1d -c counts.csv -m cells.csv -l stim -l ind --q-column q \\
    --formula \"1 + stim + ind\" --covariate stim -o de_dv.csv")]
    Test1d {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        test: TestArgs,

        /// Output file path
        #[arg(short, long, default_value = "memento_1d.csv")]
        output: String,

        /// Output format (csv or json)
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Test gene pairs for differential correlation
    #[command(name = "test-2d", after_long_help = "\
Examples:
  rust_memento test-2d -c counts.csv -m cells.csv -l stim --formula \"1 + stim\" \\
    --covariate stim --pairs pairs.csv -o corr.csv")]
    Test2d {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        test: TestArgs,

        /// Gene pairs file (header + two columns)
        #[arg(long)]
        pairs: String,

        /// Output file path
        #[arg(short, long, default_value = "memento_2d.csv")]
        output: String,

        /// Output format (csv or json)
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },
}

/// Inputs and moment estimation settings shared by all subcommands
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Count matrix CSV: first column cell IDs, header holds gene IDs
    #[arg(short, long)]
    pub counts: String,

    /// Cell metadata CSV: first column cell IDs (same order as the counts)
    #[arg(short, long)]
    pub metadata: String,

    /// Metadata column(s) defining groups
    #[arg(short, long = "label", required = true)]
    pub labels: Vec<String>,

    /// Numeric metadata column with per-cell capture probabilities
    #[arg(long)]
    pub q_column: Option<String>,

    /// Noise model: {poisson,hypergeometric}_{relative,absolute}
    #[arg(long, default_value = "hypergeometric_relative")]
    pub noise_model: NoiseModel,

    /// Quantile of residual variances below which genes count as stable
    #[arg(long, default_value = "0.1")]
    pub trim_percent: f64,

    /// Weight of the naive size factor in the final factor
    #[arg(long, default_value = "0.5")]
    pub shrinkage: f64,

    /// Size factor bins for the approximate size factors
    #[arg(long, default_value = "30")]
    pub num_bins: usize,

    /// Minimum observed mean for a gene to count as expressed in a group
    #[arg(long, default_value = "0.07")]
    pub filter_mean_thresh: f64,

    /// Fraction of groups a gene must be expressed in
    #[arg(long, default_value = "0.7")]
    pub min_perc_group: f64,

    /// Keep all genes
    #[arg(long)]
    pub no_filter: bool,
}

impl InputArgs {
    pub fn size_factor_params(&self) -> SizeFactorParams {
        SizeFactorParams {
            trim_percent: self.trim_percent,
            shrinkage: self.shrinkage,
        }
    }

    pub fn moment_params(&self) -> MomentParams {
        MomentParams {
            num_bins: self.num_bins,
            filter_mean_thresh: self.filter_mean_thresh,
            min_perc_group: self.min_perc_group,
            filter_genes: !self.no_filter,
        }
    }
}

/// Design and bootstrap settings of the hypothesis tests
#[derive(Args, Debug, Clone)]
pub struct TestArgs {
    /// Design formula over the group labels, e.g. "1 + stim + ind"
    #[arg(short, long)]
    pub formula: String,

    /// Covariate of interest (first design column containing this name)
    #[arg(long)]
    pub covariate: String,

    /// Number of bootstrap replicates
    #[arg(long, default_value = "5000")]
    pub num_boot: usize,

    /// Exact multinomial resampling instead of Dirichlet weights
    #[arg(long)]
    pub multinomial: bool,

    /// Fixed number of size factor bins for resampling
    #[arg(long)]
    pub sf_bins: Option<usize>,

    /// Base random seed
    #[arg(long, default_value = "0")]
    pub seed: u64,

    /// Minimum fraction of finite bootstrap columns
    #[arg(long, default_value = "0.5")]
    pub min_valid_fraction: f64,

    /// Largest tolerated fraction of NaN correlation replicates per group
    #[arg(long, default_value = "0.2")]
    pub max_group_nan_fraction: f64,

    /// Largest tail size tried for the GEV approximation
    #[arg(long, default_value = "300")]
    pub max_exceedances: usize,

    /// Goodness-of-fit p-value a GEV tail fit must exceed
    #[arg(long, default_value = "0.05")]
    pub gof_threshold: f64,

    /// Significance threshold for the summary
    #[arg(short, long, default_value = "0.05")]
    pub alpha: f64,
}

impl TestArgs {
    pub fn test_params(&self) -> TestParams {
        TestParams {
            bootstrap: BootstrapParams {
                num_boot: self.num_boot,
                dirichlet_approx: !self.multinomial,
                sf_bins: self.sf_bins,
            },
            asl: AslParams {
                max_exceedances: self.max_exceedances,
                gof_threshold: self.gof_threshold,
                ..AslParams::default()
            },
            seed: self.seed,
            min_valid_fraction: self.min_valid_fraction,
            max_group_nan_fraction: self.max_group_nan_fraction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_test_1d() {
        let cli = Cli::try_parse_from([
            "rust_memento",
            "test-1d",
            "-c",
            "counts.csv",
            "-m",
            "cells.csv",
            "-l",
            "stim",
            "-l",
            "ind",
            "--formula",
            "1 + stim",
            "--covariate",
            "stim",
            "--noise-model",
            "poisson_absolute",
            "--num-boot",
            "200",
            "--multinomial",
        ])
        .unwrap();

        let Commands::Test1d { input, test, format, .. } = cli.command else {
            panic!("expected test-1d");
        };
        assert_eq!(input.labels, vec!["stim", "ind"]);
        assert_eq!(input.noise_model, NoiseModel::PoissonAbsolute);
        assert_eq!(format, OutputFormat::Csv);
        let params = test.test_params();
        assert_eq!(params.bootstrap.num_boot, 200);
        assert!(!params.bootstrap.dirichlet_approx);
        assert_eq!(params.asl.min_exceedances, 50);
    }

    #[test]
    fn test_pair_summary_needs_pairs() {
        let base = [
            "rust_memento",
            "moments",
            "-c",
            "counts.csv",
            "-m",
            "cells.csv",
            "-l",
            "stim",
            "--summary-column",
            "stim",
            "--summary",
            "summary.csv",
            "--pair-summary",
            "pair_summary.csv",
        ];
        assert!(Cli::try_parse_from(base).is_err());

        let cli = Cli::try_parse_from(base.iter().copied().chain(["--pairs", "pairs.csv"])).unwrap();
        let Commands::Moments { pairs, pair_summary, .. } = cli.command else {
            panic!("expected moments");
        };
        assert_eq!(pairs.as_deref(), Some("pairs.csv"));
        assert_eq!(pair_summary.as_deref(), Some("pair_summary.csv"));
    }

    #[test]
    fn test_rejects_unknown_noise_model() {
        let parsed = Cli::try_parse_from([
            "rust_memento",
            "moments",
            "-c",
            "counts.csv",
            "-m",
            "cells.csv",
            "-l",
            "stim",
            "--noise-model",
            "negative_binomial",
        ]);
        assert!(parsed.is_err());
    }
}
