//! Result rows of the hypothesis tests

use serde::Serialize;

use crate::testing::TestStatus;

/// Differential mean (de) and variability (dv) result for one gene
#[derive(Debug, Clone, Serialize)]
pub struct OneDResult {
    pub gene: String,
    /// Covariate coefficient on the log mean
    pub de_coef: f64,
    /// ASL of the mean coefficient
    pub de_pval: f64,
    /// Covariate coefficient on the log residual variance
    pub dv_coef: f64,
    pub dv_pval: f64,
    pub de_status: TestStatus,
    pub dv_status: TestStatus,
}

/// Differential correlation result for one requested gene pair
#[derive(Debug, Clone, Serialize)]
pub struct TwoDResult {
    pub gene_1: String,
    pub gene_2: String,
    pub corr_coef: f64,
    pub corr_pval: f64,
    pub status: TestStatus,
}

/// Counts of tested and significant statistics
#[derive(Debug, Clone)]
pub struct TestSummary {
    pub label: &'static str,
    pub total: usize,
    pub tested: usize,
    pub significant: usize,
    pub positive: usize,
    pub negative: usize,
    pub alpha: f64,
}

impl TestSummary {
    fn from_outcomes<'a>(
        label: &'static str,
        total: usize,
        outcomes: impl Iterator<Item = (f64, f64, &'a TestStatus)>,
        alpha: f64,
    ) -> Self {
        let mut summary = Self {
            label,
            total,
            tested: 0,
            significant: 0,
            positive: 0,
            negative: 0,
            alpha,
        };
        for (coef, pval, status) in outcomes {
            if !status.is_tested() {
                continue;
            }
            summary.tested += 1;
            if pval.is_finite() && pval < alpha {
                summary.significant += 1;
                if coef > 0.0 {
                    summary.positive += 1;
                } else if coef < 0.0 {
                    summary.negative += 1;
                }
            }
        }
        summary
    }

    /// Summaries of the mean and variability tests
    pub fn one_d(results: &[OneDResult], alpha: f64) -> [TestSummary; 2] {
        [
            Self::from_outcomes(
                "Differential mean",
                results.len(),
                results.iter().map(|r| (r.de_coef, r.de_pval, &r.de_status)),
                alpha,
            ),
            Self::from_outcomes(
                "Differential variability",
                results.len(),
                results.iter().map(|r| (r.dv_coef, r.dv_pval, &r.dv_status)),
                alpha,
            ),
        ]
    }

    pub fn two_d(results: &[TwoDResult], alpha: f64) -> TestSummary {
        Self::from_outcomes(
            "Differential correlation",
            results.len(),
            results.iter().map(|r| (r.corr_coef, r.corr_pval, &r.status)),
            alpha,
        )
    }
}

impl std::fmt::Display for TestSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.label)?;
        writeln!(f, "  Total: {}", self.total)?;
        writeln!(f, "  Tested: {}", self.tested)?;
        writeln!(f, "  Significant (ASL < {}): {}", self.alpha, self.significant)?;
        writeln!(f, "    Positive coefficient: {}", self.positive)?;
        writeln!(f, "    Negative coefficient: {}", self.negative)?;
        Ok(())
    }
}
