// ========================================================================================
//
//                              Analysis configuration
//
// ========================================================================================
//
// Each command has its own settings struct. All of them deserialize from one optional
// TOML file (sections `[prune]`, `[ld_matrix]`, `[epistasis]` and `[resources]`) and
// carry defaults for every field, so an empty file is a valid configuration. The binary
// layers command-line flags on top before calling `validate()`.

use crate::encode::XDosagePolicy;
use crate::error::LdError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How X-chromosome dosages are weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XChromosomeModel {
    /// Treat X like an autosome.
    pub ignore_x: bool,
    /// Count non-male founders twice instead of recoding male homozygotes.
    pub weighted_x: bool,
}

impl XChromosomeModel {
    pub fn policy(self) -> XDosagePolicy {
        if self.ignore_x {
            XDosagePolicy::AsAutosome
        } else if self.weighted_x {
            XDosagePolicy::DoubleNonMale
        } else {
            XDosagePolicy::MaleHetEquivalent
        }
    }
}

/// The extent of a pruning window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowExtent {
    /// A fixed number of markers.
    Markers(usize),
    /// Every marker within this many kilobases of the window's first marker.
    Kilobases(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneMode {
    /// Drop one marker of every pair whose r² exceeds the threshold.
    Pairwise,
    /// Drop markers until every variance inflation factor is below the threshold.
    VarianceInflation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    pub mode: PruneMode,
    pub window: WindowExtent,
    pub step: usize,
    pub r2_threshold: f64,
    pub vif_threshold: f64,
    #[serde(flatten)]
    pub x_model: XChromosomeModel,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            mode: PruneMode::Pairwise,
            window: WindowExtent::Markers(50),
            step: 5,
            r2_threshold: 0.5,
            vif_threshold: 2.0,
            x_model: XChromosomeModel::default(),
        }
    }
}

impl PruneConfig {
    pub fn validate(&self) -> Result<(), LdError> {
        match self.window {
            WindowExtent::Markers(n) if n < 2 => {
                return Err(LdError::InvalidConfiguration(
                    "pruning window must hold at least 2 variants".to_string(),
                ));
            }
            WindowExtent::Markers(n) if self.step > n => {
                return Err(LdError::InvalidConfiguration(format!(
                    "step size {} exceeds the window size {n}",
                    self.step
                )));
            }
            WindowExtent::Kilobases(0) => {
                return Err(LdError::InvalidConfiguration(
                    "kilobase window must be positive".to_string(),
                ));
            }
            _ => {}
        }
        if self.step == 0 {
            return Err(LdError::InvalidConfiguration(
                "step size must be positive".to_string(),
            ));
        }
        match self.mode {
            PruneMode::Pairwise if !(self.r2_threshold > 0.0 && self.r2_threshold < 1.0) => {
                Err(LdError::InvalidConfiguration(format!(
                    "r² threshold {} must lie strictly between 0 and 1",
                    self.r2_threshold
                )))
            }
            PruneMode::VarianceInflation if !(self.vif_threshold >= 1.0) => {
                Err(LdError::InvalidConfiguration(format!(
                    "VIF threshold {} must be at least 1",
                    self.vif_threshold
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LdStatistic {
    R,
    RSquared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixShape {
    Square,
    /// Square with the upper triangle zeroed.
    Square0,
    Triangle,
    /// One line per pair.
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixEncoding {
    Text,
    Gzip,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    Tab,
    Space,
}

/// One slice of a matrix computation split across independent jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// 1-based index of this job.
    pub index: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdMatrixConfig {
    pub statistic: LdStatistic,
    pub shape: MatrixShape,
    pub encoding: MatrixEncoding,
    pub delimiter: Delimiter,
    pub single_precision: bool,
    pub shard: Option<Shard>,
    /// Required to write an unsharded matrix over more than 400000 variants.
    pub yes_really: bool,
    #[serde(flatten)]
    pub x_model: XChromosomeModel,
}

impl Default for LdMatrixConfig {
    fn default() -> Self {
        Self {
            statistic: LdStatistic::RSquared,
            shape: MatrixShape::Square,
            encoding: MatrixEncoding::Text,
            delimiter: Delimiter::Tab,
            single_precision: false,
            shard: None,
            yes_really: false,
            x_model: XChromosomeModel::default(),
        }
    }
}

impl LdMatrixConfig {
    pub fn validate(&self) -> Result<(), LdError> {
        if let Some(shard) = self.shard {
            if shard.total < 2 || shard.index == 0 || shard.index > shard.total {
                return Err(LdError::InvalidConfiguration(format!(
                    "invalid job shard {}/{}",
                    shard.index, shard.total
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpistasisMode {
    /// Contingency-table log odds ratio comparison.
    Fast,
    /// Logistic regression per pair.
    Regression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpistasisConfig {
    pub mode: EpistasisMode,
    /// Significance level for the pair report.
    pub epi1: f64,
    /// Significance level for the per-marker counts.
    pub epi2: f64,
    /// Use the plain sum of reciprocal counts as variance.
    pub no_ueki: bool,
    pub case_only: bool,
    pub no_p_value: bool,
}

impl Default for EpistasisConfig {
    fn default() -> Self {
        Self {
            mode: EpistasisMode::Fast,
            epi1: 0.0001,
            epi2: 0.01,
            no_ueki: false,
            case_only: false,
            no_p_value: false,
        }
    }
}

impl EpistasisConfig {
    pub fn validate(&self) -> Result<(), LdError> {
        for (name, value) in [("epi1", self.epi1), ("epi2", self.epi2)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(LdError::InvalidConfiguration(format!(
                    "{name} must lie in (0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Thread and memory limits shared by every command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub threads: Option<usize>,
    pub memory_bytes: Option<usize>,
}

impl ResourceConfig {
    pub fn thread_count(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub prune: PruneConfig,
    pub ld_matrix: LdMatrixConfig,
    pub epistasis: EpistasisConfig,
    pub resources: ResourceConfig,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, LdError> {
        let text = fs::read_to_string(path).map_err(|e| LdError::open(path, e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, LdError> {
        toml::from_str(text).map_err(|e| LdError::InvalidConfiguration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ConfigFile::parse("").unwrap();
        assert_eq!(config.prune, PruneConfig::default());
        assert_eq!(config.prune.window, WindowExtent::Markers(50));
        assert_eq!(config.prune.step, 5);
        assert_eq!(config.epistasis.epi1, 0.0001);
        assert_eq!(config.ld_matrix.delimiter, Delimiter::Tab);
        assert!(config.prune.validate().is_ok());
        assert!(config.epistasis.validate().is_ok());
    }

    #[test]
    fn sections_override_defaults() {
        let config = ConfigFile::parse(
            r#"
            [prune]
            mode = "variance_inflation"
            window = { kilobases = 250 }
            step = 1
            vif_threshold = 5.0
            weighted_x = true

            [ld_matrix]
            statistic = "r"
            encoding = "gzip"
            shard = { index = 2, total = 4 }

            [resources]
            threads = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.prune.mode, PruneMode::VarianceInflation);
        assert_eq!(config.prune.window, WindowExtent::Kilobases(250));
        assert_eq!(config.prune.x_model.policy(), XDosagePolicy::DoubleNonMale);
        assert_eq!(config.ld_matrix.statistic, LdStatistic::R);
        assert_eq!(config.ld_matrix.shard, Some(Shard { index: 2, total: 4 }));
        assert_eq!(config.resources.thread_count(), 3);
        assert!(config.prune.validate().is_ok());
        assert!(config.ld_matrix.validate().is_ok());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut prune = PruneConfig {
            step: 0,
            ..PruneConfig::default()
        };
        assert!(matches!(
            prune.validate(),
            Err(LdError::InvalidConfiguration(_))
        ));
        prune.step = 5;
        prune.r2_threshold = 1.5;
        assert!(prune.validate().is_err());

        let epi = EpistasisConfig {
            epi2: 0.0,
            ..EpistasisConfig::default()
        };
        assert!(epi.validate().is_err());

        let ld = LdMatrixConfig {
            shard: Some(Shard { index: 5, total: 4 }),
            ..LdMatrixConfig::default()
        };
        assert!(ld.validate().is_err());

        assert!(ConfigFile::parse("[prune]\nstep = \"five\"").is_err());
    }

    #[test]
    fn x_model_policies() {
        let ignore = XChromosomeModel {
            ignore_x: true,
            weighted_x: true,
        };
        assert_eq!(ignore.policy(), XDosagePolicy::AsAutosome);
        assert_eq!(
            XChromosomeModel::default().policy(),
            XDosagePolicy::MaleHetEquivalent
        );
    }
}
