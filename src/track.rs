use std::{fmt::Display, path::Path, str::FromStr};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SvType {
    Del,
    Ins,
    Inv,
    Mei,
}

impl FromStr for SvType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEL" => Ok(SvType::Del),
            "INS" => Ok(SvType::Ins),
            "INV" => Ok(SvType::Inv),
            // ALU calls are mobile element insertions under a narrower name
            "MEI" | "ALU" => Ok(SvType::Mei),
            _ => Err(CatalogError::UnknownSvType(s.to_string())),
        }
    }
}

impl Display for SvType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SvType::Del => "DEL",
            SvType::Ins => "INS",
            SvType::Inv => "INV",
            SvType::Mei => "MEI",
        };
        write!(f, "{s}")
    }
}

/// A candidate structural variant. Immutable after load; coordinates are
/// half-open on the reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub chrom: String,
    pub begin: u64,
    pub end: u64,
    pub svtype: SvType,
    pub svlen: i64,
    /// Inserted sequence, INS/MEI only.
    pub sequence: Option<String>,
    /// Truth label from the catalog, echoed into confidence.bed.
    pub genotype: Option<String>,
}

impl Track {
    /// Stable identifier used as map key and in synthetic locus names.
    pub fn name(&self) -> String {
        format!("{}@{}_{}_{}", self.svtype, self.chrom, self.begin, self.end)
    }

    pub fn span(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn abs_svlen(&self) -> u64 {
        self.svlen.unsigned_abs()
    }

    fn from_record(record: &csv::StringRecord, line: u64) -> Result<Self, CatalogError> {
        let field = |i: usize| -> Result<&str, CatalogError> {
            record
                .get(i)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(CatalogError::MissingColumn { line, column: i })
        };
        let chrom = field(0)?.to_string();
        let begin: u64 = field(1)?
            .parse()
            .map_err(|_| CatalogError::BadCoordinate { line })?;
        let end: u64 = field(2)?
            .parse()
            .map_err(|_| CatalogError::BadCoordinate { line })?;
        if end < begin {
            return Err(CatalogError::BadCoordinate { line });
        }
        let id = field(3)?.to_string();
        let svtype: SvType = field(4)?.parse()?;
        let svlen: i64 = match field(5) {
            Ok(".") | Err(_) => 0,
            Ok(s) => s.parse().map_err(|_| CatalogError::BadSvLen { line })?,
        };

        // The two optional trailing columns are the inserted sequence and a
        // truth genotype; a lone trailing genotype is recognized by its '/'.
        let mut sequence = None;
        let mut genotype = None;
        if let Some(s) = record.get(6).map(str::trim).filter(|s| !s.is_empty() && *s != ".") {
            if s.contains('/') {
                genotype = Some(s.to_string());
            } else {
                sequence = Some(s.to_ascii_uppercase());
            }
        }
        if let Some(s) = record.get(7).map(str::trim).filter(|s| !s.is_empty() && *s != ".") {
            genotype = Some(s.to_string());
        }

        let mut track = Track {
            id,
            chrom,
            begin,
            end,
            svtype,
            svlen,
            sequence,
            genotype,
        };
        if track.svlen == 0 {
            track.svlen = match track.svtype {
                SvType::Ins | SvType::Mei => {
                    track.sequence.as_ref().map(|s| s.len() as i64).unwrap_or(0)
                }
                SvType::Del | SvType::Inv => track.span() as i64,
            };
        }
        if matches!(track.svtype, SvType::Ins | SvType::Mei) && track.sequence.is_none() {
            return Err(CatalogError::MissingSequence { line });
        }
        Ok(track)
    }
}

/// Load the SV catalog from a BED-like TSV:
/// `chrom begin end id svtype svlen [inserted_seq] [genotype]`.
pub fn load_catalog<P: AsRef<Path>>(path: P) -> Result<Vec<Track>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)
        .map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?;
    let mut tracks = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?;
        let track = Track::from_record(&record, idx as u64 + 1)
            .map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?;
        tracks.push(track);
    }
    log::info!("Loaded {} tracks from {}", tracks.len(), path.display());
    Ok(tracks)
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("line {line}: missing column {column}")]
    MissingColumn { line: u64, column: usize },
    #[error("line {line}: invalid coordinates")]
    BadCoordinate { line: u64 },
    #[error("line {line}: invalid svlen")]
    BadSvLen { line: u64 },
    #[error("line {line}: INS track without inserted sequence")]
    MissingSequence { line: u64 },
    #[error("unknown svtype {0:?}")]
    UnknownSvType(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_line(line: &str) -> Result<Track, CatalogError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(line.as_bytes());
        let record = reader.records().next().unwrap().unwrap();
        Track::from_record(&record, 1)
    }

    #[test]
    fn parses_deletion() {
        let track = parse_line("chr1\t4000\t4200\tdel_1\tDEL\t200").unwrap();
        assert_eq!(track.svtype, SvType::Del);
        assert_eq!(track.span(), 200);
        assert_eq!(track.name(), "DEL@chr1_4000_4200");
        assert_eq!(track.genotype, None);
    }

    #[test]
    fn parses_insertion_with_sequence_and_genotype() {
        let track = parse_line("chr2\t100\t100\tins_1\tINS\t8\tACGTACGT\t0/1").unwrap();
        assert_eq!(track.svtype, SvType::Ins);
        assert_eq!(track.sequence.as_deref(), Some("ACGTACGT"));
        assert_eq!(track.genotype.as_deref(), Some("0/1"));
    }

    #[test]
    fn derives_svlen_when_missing() {
        let track = parse_line("chr1\t10\t110\tdel_2\tDEL\t.").unwrap();
        assert_eq!(track.abs_svlen(), 100);
        let track = parse_line("chr1\t10\t10\tins_2\tINS\t.\tAAAATTTT").unwrap();
        assert_eq!(track.abs_svlen(), 8);
    }

    #[test]
    fn genotype_in_seventh_column() {
        let track = parse_line("chr1\t10\t110\tdel_3\tDEL\t100\t1/1").unwrap();
        assert_eq!(track.genotype.as_deref(), Some("1/1"));
        assert_eq!(track.sequence, None);
    }

    #[test]
    fn rejects_unknown_svtype() {
        assert!(matches!(
            parse_line("chr1\t10\t110\tx\tBND\t100"),
            Err(CatalogError::UnknownSvType(_))
        ));
    }

    #[test]
    fn rejects_insertion_without_sequence() {
        assert!(matches!(
            parse_line("chr1\t10\t10\tx\tINS\t50"),
            Err(CatalogError::MissingSequence { .. })
        ));
    }
}
