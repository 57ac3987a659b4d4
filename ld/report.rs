// ========================================================================================
//
//                              Text outputs and their formats
//
// ========================================================================================

use crate::error::LdError;
use crate::io::MarkerMetadata;
use crate::types::chromosome_label;
use crate::window::PruneOutcome;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Significant digits used by the epistasis reports.
pub const REPORT_DIGITS: usize = 4;

/// `prefix` with `suffix` appended verbatim, so `out/run` + `.ld` gives `out/run.ld`.
pub fn output_path(prefix: &Path, suffix: &str) -> PathBuf {
    let mut raw = prefix.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn trim_fraction(digits: &str) -> &str {
    if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.')
    } else {
        digits
    }
}

/// Formats `value` the way C's `%.{precision}g` does: fixed notation when the decimal
/// exponent lies in `[-4, precision)`, scientific otherwise, trailing zeros dropped.
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, value);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if exponent < -4 || exponent >= precision as i32 {
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            if exponent < 0 { '-' } else { '+' },
            exponent.abs()
        )
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

/// Width of a right-aligned marker id column: the longest id, at least 4.
pub fn id_column_width<'a>(ids: impl IntoIterator<Item = &'a str>) -> usize {
    ids.into_iter().map(str::len).max().unwrap_or(0).max(4)
}

fn create(path: &Path) -> Result<BufWriter<File>, LdError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| LdError::open(path, e))
}

/// Writes `prefix.prune.in` and `prefix.prune.out`, one marker id per line in file order.
pub fn write_prune_lists<M: MarkerMetadata + ?Sized>(
    prefix: &Path,
    metadata: &M,
    outcome: &PruneOutcome,
) -> Result<(PathBuf, PathBuf), LdError> {
    let kept_path = output_path(prefix, ".prune.in");
    let removed_path = output_path(prefix, ".prune.out");
    let mut kept = create(&kept_path)?;
    let mut removed = create(&removed_path)?;
    for marker in outcome.considered.iter().copied() {
        let (out, path) = if outcome.pruned[marker.get()] {
            (&mut removed, &removed_path)
        } else {
            (&mut kept, &kept_path)
        };
        writeln!(out, "{}", metadata.marker_id(marker)).map_err(|e| LdError::write(path, e))?;
    }
    kept.flush().map_err(|e| LdError::write(&kept_path, e))?;
    removed.flush().map_err(|e| LdError::write(&removed_path, e))?;
    Ok((kept_path, removed_path))
}

/// The per-pair epistasis report, `prefix.epi.cc`.
pub struct PairReportWriter {
    path: PathBuf,
    out: BufWriter<File>,
    id_width: usize,
    with_p_value: bool,
}

impl PairReportWriter {
    pub fn create(prefix: &Path, id_width: usize, with_p_value: bool) -> Result<Self, LdError> {
        let path = output_path(prefix, ".epi.cc");
        let out = create(&path)?;
        let mut writer = Self {
            path,
            out,
            id_width,
            with_p_value,
        };
        let w = writer.id_width;
        let mut header = format!("CHR1 {:>w$} CHR2 {:>w$} {:>12} ", "SNP1", "SNP2", "STAT");
        if writer.with_p_value {
            header.push_str(&format!("{:>12} ", "P"));
        }
        writeln!(writer.out, "{header}").map_err(|e| LdError::write(&writer.path, e))?;
        Ok(writer)
    }

    pub fn write_pair(
        &mut self,
        first: (u8, &str),
        second: (u8, &str),
        zsq: f64,
        p_value: f64,
    ) -> Result<(), LdError> {
        let w = self.id_width;
        write!(
            self.out,
            "{:>4} {:>w$} {:>4} {:>w$} {:>12} ",
            chromosome_label(first.0),
            first.1,
            chromosome_label(second.0),
            second.1,
            format_g(zsq, REPORT_DIGITS)
        )
        .map_err(|e| LdError::write(&self.path, e))?;
        if self.with_p_value {
            write!(self.out, "{:>12} ", format_g(p_value, REPORT_DIGITS))
                .map_err(|e| LdError::write(&self.path, e))?;
        }
        writeln!(self.out).map_err(|e| LdError::write(&self.path, e))
    }

    pub fn finish(mut self) -> Result<PathBuf, LdError> {
        self.out.flush().map_err(|e| LdError::write(&self.path, e))?;
        Ok(self.path)
    }
}

/// One line of `prefix.epi.cc.summary`.
pub struct SummaryRow<'a> {
    pub chromosome: u8,
    pub id: &'a str,
    pub significant: u32,
    pub valid: u32,
    /// Best statistic and the chromosome and id of its partner.
    pub best: Option<(f64, u8, &'a str)>,
}

/// Writes the per-marker epistasis summary.
pub fn write_epistasis_summary<'a>(
    prefix: &Path,
    id_width: usize,
    rows: impl IntoIterator<Item = SummaryRow<'a>>,
) -> Result<PathBuf, LdError> {
    let path = output_path(prefix, ".epi.cc.summary");
    let mut out = create(&path)?;
    let w = id_width;
    let best_w = id_width.max(8);
    writeln!(
        out,
        "{:>4} {:>w$} {:>12} {:>12} {:>12} {:>12} {:>8} {:>best_w$} ",
        "CHR", "SNP", "N_SIG", "N_TOT", "PROP", "BEST_CHISQ", "BEST_CHR", "BEST_SNP"
    )
    .map_err(|e| LdError::write(&path, e))?;

    for row in rows {
        let proportion = if row.valid == 0 {
            "NA".to_string()
        } else {
            format_g(row.significant as f64 / row.valid as f64, REPORT_DIGITS)
        };
        let (best_stat, best_chr, best_id) = match row.best {
            Some((stat, chr, id)) if row.valid > 0 => {
                (format_g(stat, REPORT_DIGITS), chromosome_label(chr), id)
            }
            _ => ("NA".to_string(), "NA".to_string(), "NA"),
        };
        writeln!(
            out,
            "{:>4} {:>w$} {:>12} {:>12} {:>12} {:>12} {:>8} {:>best_w$} ",
            chromosome_label(row.chromosome),
            row.id,
            row.significant,
            row.valid,
            proportion,
            best_stat,
            best_chr,
            best_id
        )
        .map_err(|e| LdError::write(&path, e))?;
    }
    out.flush().map_err(|e| LdError::write(&path, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tests::MemoryDataset;
    use crate::types::MarkerIndex;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn format_g_matches_printf() {
        assert_eq!(format_g(0.818181818, 6), "0.818182");
        assert_eq!(format_g(0.6694214876, 6), "0.669421");
        assert_eq!(format_g(1.0, 6), "1");
        assert_eq!(format_g(-2.5, 6), "-2.5");
        assert_eq!(format_g(100000.0, 6), "100000");
        assert_eq!(format_g(123456789.0, 6), "1.23457e+08");
        assert_eq!(format_g(0.0001, 6), "0.0001");
        assert_eq!(format_g(0.00001234, 6), "1.234e-05");
        assert_eq!(format_g(0.0, 6), "0");
        assert_eq!(format_g(f64::NAN, 6), "nan");
        assert_eq!(format_g(15.1372, 4), "15.14");
        assert_eq!(format_g(9.99996, 4), "10");
    }

    #[test]
    fn output_paths_append_suffixes() {
        assert_eq!(
            output_path(Path::new("out/run.v2"), ".ld.gz"),
            PathBuf::from("out/run.v2.ld.gz")
        );
    }

    #[test]
    fn prune_lists_split_considered_markers() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("pruned");
        let dataset = MemoryDataset::new(vec![
            (0, 1, vec![0, 1]),
            (1, 2, vec![0, 1]),
            (1, 3, vec![1, 2]),
            (1, 4, vec![2, 1]),
        ]);
        let outcome = PruneOutcome {
            considered: vec![MarkerIndex(1), MarkerIndex(2), MarkerIndex(3)],
            pruned: vec![false, false, true, false],
        };
        let (kept, removed) = write_prune_lists(&prefix, &dataset, &outcome).unwrap();
        assert_eq!(fs::read_to_string(kept).unwrap(), "m1\nm3\n");
        assert_eq!(fs::read_to_string(removed).unwrap(), "m2\n");
    }

    #[test]
    fn epistasis_reports_are_column_aligned() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("epi");
        let width = id_column_width(["rs1", "rs12345"]);
        assert_eq!(width, 7);

        let mut pairs = PairReportWriter::create(&prefix, width, true).unwrap();
        pairs.write_pair((1, "rs1"), (23, "rs12345"), 17.5, 2.87e-5).unwrap();
        let pair_path = pairs.finish().unwrap();
        let text = fs::read_to_string(pair_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "CHR1    SNP1 CHR2    SNP2         STAT            P "
        );
        assert_eq!(
            lines[1],
            "   1     rs1    X rs12345         17.5     2.87e-05 "
        );
        assert_eq!(lines[0].len(), lines[1].len());

        let summary = write_epistasis_summary(
            &prefix,
            width,
            [
                SummaryRow {
                    chromosome: 1,
                    id: "rs1",
                    significant: 1,
                    valid: 4,
                    best: Some((17.5, 23, "rs12345")),
                },
                SummaryRow {
                    chromosome: 23,
                    id: "rs12345",
                    significant: 0,
                    valid: 0,
                    best: None,
                },
            ],
        )
        .unwrap();
        let text = fs::read_to_string(summary).unwrap();
        let rows: Vec<Vec<&str>> = text.lines().map(|l| l.split_whitespace().collect()).collect();
        assert_eq!(
            rows[0],
            ["CHR", "SNP", "N_SIG", "N_TOT", "PROP", "BEST_CHISQ", "BEST_CHR", "BEST_SNP"]
        );
        assert_eq!(rows[1], ["1", "rs1", "1", "4", "0.25", "17.5", "X", "rs12345"]);
        assert_eq!(rows[2], ["X", "rs12345", "0", "0", "NA", "NA", "NA", "NA"]);
    }
}
