//! Part-file naming: suffix classification, first-part selection and
//! in-memory renaming of heterogeneously named multi-part sets.
//!
//! Usenet posts name archive volumes in several historic schemes
//! (`x.part01.rar`, `x.rar`+`x.r00`, bare `x.001`). The archive walkers key
//! volumes off a shared stem, so before analysis all part names are rewritten
//! to one stem while keeping each name's suffix form.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PART_N_RAR: Regex = Regex::new(r"(?i)^(.*)(\.part)(\d+)(\.rar)$").unwrap();
    static ref BARE_RAR: Regex = Regex::new(r"(?i)^(.*)(\.rar)$").unwrap();
    static ref R_NN: Regex = Regex::new(r"(?i)^(.*)(\.r)(\d{2,})$").unwrap();
    static ref NUMERIC: Regex = Regex::new(r"^(.*)(\.)(\d{3,4})$").unwrap();
    static ref SEVENZIP: Regex = Regex::new(r"(?i)^(.*\.7z)(?:\.(\d+))?$").unwrap();
}

/// The recognized multi-part suffix forms, in first-part priority order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartSuffix {
    /// `name.rar` without a `.partN` component; always the entry point.
    Rar,
    /// `name.partNNN.rar`, 1-based on the wire.
    PartN(usize),
    /// `name.rNN`, 0-based on the wire.
    RNn(usize),
    /// `name.NNN`, 1-based on the wire.
    Numeric(usize),
}

impl PartSuffix {
    /// Zero-based position of this part within its set.
    pub fn index(&self) -> usize {
        match *self {
            PartSuffix::Rar => 0,
            PartSuffix::PartN(n) => n.saturating_sub(1),
            PartSuffix::RNn(n) => n,
            PartSuffix::Numeric(n) => n.saturating_sub(1),
        }
    }

    /// Ordering across suffix families: in the old `.rar`+`.rNN` scheme the
    /// bare `.rar` volume precedes every `.rNN`.
    fn sort_key(&self) -> (u8, usize) {
        match *self {
            PartSuffix::Rar => (0, 0),
            PartSuffix::PartN(n) => (1, n.saturating_sub(1)),
            PartSuffix::RNn(n) => (2, n),
            PartSuffix::Numeric(n) => (3, n.saturating_sub(1)),
        }
    }
}

/// Split a filename into `(stem, suffix_text, form)` when it matches one of
/// the part naming schemes. The suffix text is preserved verbatim so
/// normalization keeps `part01` vs `part001` digits intact.
pub fn split_part_suffix(name: &str) -> Option<(String, String, PartSuffix)> {
    if let Some(c) = PART_N_RAR.captures(name) {
        let n: usize = c[3].parse().ok()?;
        return Some((
            c[1].to_string(),
            format!("{}{}{}", &c[2], &c[3], &c[4]),
            PartSuffix::PartN(n),
        ));
    }
    if let Some(c) = BARE_RAR.captures(name) {
        return Some((c[1].to_string(), c[2].to_string(), PartSuffix::Rar));
    }
    if let Some(c) = R_NN.captures(name) {
        let n: usize = c[3].parse().ok()?;
        return Some((
            c[1].to_string(),
            format!("{}{}", &c[2], &c[3]),
            PartSuffix::RNn(n),
        ));
    }
    if let Some(c) = NUMERIC.captures(name) {
        let n: usize = c[3].parse().ok()?;
        return Some((
            c[1].to_string(),
            format!("{}{}", &c[2], &c[3]),
            PartSuffix::Numeric(n),
        ));
    }
    None
}

/// Zero-based part index for RAR-family names. `None` for anything that is
/// not a RAR volume name. Bare `.NNN` splits are deliberately excluded here:
/// they only count as RAR volumes once an archive context is established,
/// otherwise plain split files would classify as archives.
pub fn rar_part_index(name: &str) -> Option<usize> {
    match split_part_suffix(name)?.2 {
        s @ (PartSuffix::Rar | PartSuffix::PartN(_) | PartSuffix::RNn(_)) => Some(s.index()),
        PartSuffix::Numeric(_) => None,
    }
}

/// Zero-based volume index for 7-Zip names (`x.7z` or `x.7z.NNN`).
pub fn sevenzip_part_index(name: &str) -> Option<usize> {
    let c = SEVENZIP.captures(name)?;
    match c.get(2) {
        None => Some(0),
        Some(n) => {
            let n: usize = n.as_str().parse().ok()?;
            Some(n.saturating_sub(1))
        }
    }
}

/// Select the archive entry point from a set of part filenames.
///
/// Priority: bare `.rar` without `.part`, then `.partNNN.rar`, then `.rNN`,
/// then `.NNN`; sets matching nothing fall back to the lexicographically
/// first name.
pub fn find_first_part<'a>(names: &[&'a str]) -> Option<&'a str> {
    if names.is_empty() {
        return None;
    }

    let mut best: Option<(&str, (u8, usize))> = None;
    for name in names {
        let Some((_, _, suffix)) = split_part_suffix(name) else {
            continue;
        };
        let key = suffix.sort_key();
        let better = match best {
            None => true,
            // Prefer the lower family/index; ties break lexicographically.
            Some((cur, cur_key)) => key < cur_key || (key == cur_key && *name < cur),
        };
        if better {
            best = Some((name, key));
        }
    }

    best.map(|(name, _)| name)
        .or_else(|| names.iter().min().copied())
}

/// One part file after in-memory renaming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedPart {
    /// Name as listed in the NZB.
    pub original: String,
    /// Name presented to the archive walker.
    pub name: String,
    /// Zero-based position within the set.
    pub index: usize,
}

/// Rewrite all part names to share one stem (the lexicographically first
/// part's stem), preserving each name's suffix form, and order the result by
/// part index. Names matching no suffix form keep their own name and sort
/// last, lexicographically.
pub fn normalize_parts(names: &[&str]) -> Vec<NormalizedPart> {
    let base = names
        .iter()
        .min()
        .and_then(|first| split_part_suffix(first))
        .map(|(stem, _, _)| stem);

    let mut parts: Vec<(NormalizedPart, (u8, usize))> = names
        .iter()
        .map(|name| match (split_part_suffix(name), &base) {
            (Some((_, suffix_text, form)), Some(stem)) => (
                NormalizedPart {
                    original: name.to_string(),
                    name: format!("{stem}{suffix_text}"),
                    index: form.index(),
                },
                form.sort_key(),
            ),
            _ => (
                NormalizedPart {
                    original: name.to_string(),
                    name: name.to_string(),
                    index: usize::MAX,
                },
                (u8::MAX, usize::MAX),
            ),
        })
        .collect();

    parts.sort_by(|(a, ka), (b, kb)| ka.cmp(kb).then_with(|| a.original.cmp(&b.original)));
    parts.into_iter().map(|(p, _)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("movie.rar", Some(0))]
    #[case("movie.part1.rar", Some(0))]
    #[case("movie.part001.rar", Some(0))]
    #[case("Movie.PART02.RAR", Some(1))]
    #[case("movie.r00", Some(0))]
    #[case("movie.r15", Some(15))]
    #[case("movie.001", None)]
    #[case("movie.mkv", None)]
    #[case("movie.7z.001", None)]
    fn rar_index(#[case] name: &str, #[case] expected: Option<usize>) {
        assert_eq!(expected, rar_part_index(name));
    }

    #[rstest]
    #[case("movie.7z", Some(0))]
    #[case("movie.7z.001", Some(0))]
    #[case("movie.7z.014", Some(13))]
    #[case("movie.rar", None)]
    fn sevenzip_index(#[case] name: &str, #[case] expected: Option<usize>) {
        assert_eq!(expected, sevenzip_part_index(name));
    }

    #[test]
    fn first_part_prefers_bare_rar() {
        let names = ["x.r00", "x.part2.rar", "x.rar"];
        assert_eq!(Some("x.rar"), find_first_part(&names));
    }

    #[test]
    fn first_part_partn_beats_rnn() {
        let names = ["x.r00", "x.part001.rar", "x.part002.rar"];
        assert_eq!(Some("x.part001.rar"), find_first_part(&names));
    }

    #[test]
    fn first_part_numeric_fallback() {
        let names = ["x.002", "x.001", "x.003"];
        assert_eq!(Some("x.001"), find_first_part(&names));
    }

    #[test]
    fn first_part_lexicographic_when_unrecognized() {
        let names = ["b.bin", "a.bin"];
        assert_eq!(Some("a.bin"), find_first_part(&names));
    }

    #[test]
    fn normalize_mixed_stems() {
        // Heterogeneous posts sometimes rename later volumes; the walker
        // still needs one stem across the set.
        let names = ["aaa.part1.rar", "zzz.part2.rar", "mmm.part3.rar"];
        let parts = normalize_parts(&names);

        assert_eq!(
            vec!["aaa.part1.rar", "aaa.part2.rar", "aaa.part3.rar"],
            parts.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()
        );
        assert_eq!(
            vec!["aaa.part1.rar", "zzz.part2.rar", "mmm.part3.rar"],
            parts.iter().map(|p| p.original.as_str()).collect::<Vec<_>>()
        );
        assert_eq!(vec![0, 1, 2], parts.iter().map(|p| p.index).collect::<Vec<_>>());
    }

    #[test]
    fn normalize_orders_old_scheme() {
        let names = ["x.r01", "x.rar", "x.r00"];
        let parts = normalize_parts(&names);
        assert_eq!(
            vec!["x.rar", "x.r00", "x.r01"],
            parts.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn normalize_preserves_digit_width() {
        let names = ["a.part001.rar", "a.part002.rar"];
        let parts = normalize_parts(&names);
        assert_eq!("a.part002.rar", parts[1].name);
    }
}
