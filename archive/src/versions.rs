//! Parses the version-spec grammar shared by `build`, `verify`, and
//! `status`: a bare `X.Y`, an open-ended `X.Y+` (that version and newer),
//! or an inclusive range `X.Y-A.B`.

use anyhow::{bail, Context, Result};
use source_mirror::TargetVersion;

pub fn parse_spec(spec: &str, known: &[TargetVersion]) -> Result<Vec<TargetVersion>> {
    if let Some(base) = spec.strip_suffix('+') {
        let base = parse_version(base)?;
        let mut matches: Vec<TargetVersion> = known.iter().copied().filter(|v| *v >= base).collect();
        matches.sort();
        return Ok(matches);
    }

    if let Some((lo, hi)) = spec.split_once('-') {
        let lo = parse_version(lo)?;
        let hi = parse_version(hi)?;
        let mut matches: Vec<TargetVersion> = known
            .iter()
            .copied()
            .filter(|v| *v >= lo && *v <= hi)
            .collect();
        matches.sort();
        return Ok(matches);
    }

    let v = parse_version(spec)?;
    if !known.contains(&v) {
        bail!(
            "unknown version {v}; known versions: {}",
            describe(known)
        );
    }
    Ok(vec![v])
}

/// Resolve `specs` against `known`, defaulting to the newest known version
/// when `specs` is empty.
pub fn resolve(specs: &[String], known: &[TargetVersion]) -> Result<Vec<TargetVersion>> {
    if specs.is_empty() {
        let newest = known.iter().copied().max().context("no known versions")?;
        return Ok(vec![newest]);
    }

    let mut out = Vec::new();
    for spec in specs {
        out.extend(parse_spec(spec, known)?);
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn parse_version(s: &str) -> Result<TargetVersion> {
    let (major, minor) = s
        .split_once('.')
        .with_context(|| format!("'{s}' is not a version of the form X.Y"))?;
    Ok(TargetVersion {
        major: major.parse().with_context(|| format!("'{s}' has a non-numeric major"))?,
        minor: minor.parse().with_context(|| format!("'{s}' has a non-numeric minor"))?,
    })
}

fn describe(known: &[TargetVersion]) -> String {
    known
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(major: u64, minor: u64) -> TargetVersion {
        TargetVersion { major, minor }
    }

    #[test]
    fn parses_bare_version() {
        let known = [v(1, 9), v(1, 10)];
        assert_eq!(parse_spec("1.10", &known).unwrap(), vec![v(1, 10)]);
        assert!(parse_spec("1.11", &known).is_err());
    }

    #[test]
    fn parses_open_ended_range() {
        let known = [v(1, 8), v(1, 9), v(1, 10)];
        assert_eq!(parse_spec("1.9+", &known).unwrap(), vec![v(1, 9), v(1, 10)]);
    }

    #[test]
    fn parses_closed_range() {
        let known = [v(1, 6), v(1, 8), v(1, 9), v(1, 10)];
        assert_eq!(
            parse_spec("1.8-1.9", &known).unwrap(),
            vec![v(1, 8), v(1, 9)]
        );
    }

    #[test]
    fn empty_specs_default_to_newest() {
        let known = [v(1, 9), v(1, 10)];
        assert_eq!(resolve(&[], &known).unwrap(), vec![v(1, 10)]);
    }
}
