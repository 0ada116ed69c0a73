//! Platform selection for multi-platform archives.
//!
//! An OCI index (or Docker manifest list) carries one manifest per platform.  Unless every platform
//! was requested, only the best match for each requested platform is imported and unpacked.
//!
//! Matching is strict: operating system and architecture must be equal after normalization, the
//! variant only decides between several candidates with the same architecture.  Remaining ties go
//! to the first candidate in index order.

use std::{fmt, str::FromStr};

use oci_spec::image::{Arch, Os};

use crate::{archive::ArchiveEntry, digest::Digest, error::Error};

/// An `os/architecture[/variant]` triple, always kept in normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    os: String,
    architecture: String,
    variant: Option<String>,
}

fn normalize_os(os: &str) -> String {
    match os.to_ascii_lowercase().as_str() {
        "macos" => "darwin".to_string(),
        other => other.to_string(),
    }
}

fn normalize_arch(arch: &str, variant: Option<&str>) -> (String, Option<String>) {
    let arch = arch.to_ascii_lowercase();
    let variant = variant
        .filter(|v| !v.is_empty())
        .map(str::to_ascii_lowercase);

    match arch.as_str() {
        "i386" | "x86" => ("386".into(), None),
        "x86_64" | "x86-64" | "amd64" => match variant.as_deref() {
            None | Some("v1") => ("amd64".into(), None),
            Some(_) => ("amd64".into(), variant.clone()),
        },
        "aarch64" | "arm64" => match variant.as_deref() {
            None | Some("8") | Some("v8") => ("arm64".into(), None),
            Some(_) => ("arm64".into(), variant.clone()),
        },
        "armhf" => ("arm".into(), Some("v7".into())),
        "armel" => ("arm".into(), Some("v6".into())),
        "arm" => match variant.as_deref() {
            None | Some("7") | Some("v7") => ("arm".into(), Some("v7".into())),
            Some(v @ ("5" | "6" | "8")) => ("arm".into(), Some(format!("v{v}"))),
            Some(_) => ("arm".into(), variant.clone()),
        },
        _ => (arch, variant),
    }
}

const KNOWN_OS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "illumos", "ios", "js", "linux", "netbsd",
    "openbsd", "plan9", "solaris", "windows",
];

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        let (architecture, variant) = normalize_arch(architecture, variant);
        Self {
            os: normalize_os(os),
            architecture,
            variant,
        }
    }

    /// The platform this process runs on.
    pub fn host() -> Self {
        Self::new(&Os::default().to_string(), &Arch::default().to_string(), None)
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// How well `candidate` satisfies `self`, or `None` if it can't be used at all.
    fn score(&self, candidate: &Platform) -> Option<u8> {
        if self.os != candidate.os || self.architecture != candidate.architecture {
            return None;
        }
        match (&self.variant, &candidate.variant) {
            (Some(want), Some(have)) if want == have => Some(2),
            (Some(_), Some(_)) => None,
            (None, None) => Some(2),
            _ => Some(1),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = Error;

    /// Parse `os[/arch[/variant]]`.  A single component is taken as an operating system if it
    /// names one and as an architecture otherwise; the missing half comes from the host.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| Error::InvalidPlatform(s.to_string(), why.to_string());
        let parts: Vec<&str> = s.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty component"));
        }

        let host = Self::host();
        match parts.as_slice() {
            [one] if KNOWN_OS.contains(&one.to_ascii_lowercase().as_str()) => {
                Ok(Self::new(one, &host.architecture, None))
            }
            [one] => Ok(Self::new(&host.os, one, None)),
            [os, arch] => Ok(Self::new(os, arch, None)),
            [os, arch, variant] => Ok(Self::new(os, arch, Some(variant))),
            _ => Err(invalid("expected os[/arch[/variant]]")),
        }
    }
}

impl From<&oci_spec::image::Platform> for Platform {
    fn from(platform: &oci_spec::image::Platform) -> Self {
        Self::new(
            &platform.os().to_string(),
            &platform.architecture().to_string(),
            platform.variant().as_deref(),
        )
    }
}

/// Which platforms of a multi-platform index to import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PlatformMode {
    /// The best match for the host platform.
    #[default]
    Default,
    /// Every platform.
    All,
    /// The best match for each of the given platforms.
    Only(Vec<Platform>),
}

impl PlatformMode {
    /// The platforms that are looked for, or `None` for [`PlatformMode::All`].
    pub fn requested(&self) -> Option<Vec<Platform>> {
        match self {
            PlatformMode::Default => Some(vec![Platform::host()]),
            PlatformMode::All => None,
            PlatformMode::Only(platforms) => Some(platforms.clone()),
        }
    }
}

/// An index had platform-specific manifests, but none for the requested platform(s).
///
/// This is a warning: the index is skipped and the rest of the archive is still imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUnmatched {
    /// Name of the image whose index was skipped.  Empty until the importer fills it in.
    pub image: String,
    pub index: Option<Digest>,
    pub requested: Vec<Platform>,
    pub available: Vec<Platform>,
}

impl PlatformUnmatched {
    pub(crate) fn for_index(mut self, image: &str, index: &Digest) -> Self {
        self.image = image.to_string();
        self.index = Some(*index);
        self
    }
}

fn join(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(Platform::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for PlatformUnmatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no manifest for {}", join(&self.requested))?;
        if !self.image.is_empty() {
            write!(f, " in {}", self.image)?;
        }
        write!(f, " (available: {})", join(&self.available))
    }
}

/// The outcome of filtering one index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub selected: Vec<ArchiveEntry>,
    pub unmatched: Option<PlatformUnmatched>,
}

/// Pick the entries of one index (or a lone manifest) to import.
///
/// Entries without a platform describe single-platform images and always pass.
pub fn select(entries: &[ArchiveEntry], mode: &PlatformMode) -> Selection {
    let Some(requested) = mode.requested() else {
        return Selection {
            selected: entries.to_vec(),
            unmatched: None,
        };
    };

    let mut picked = vec![false; entries.len()];
    let mut candidates = 0;
    for (idx, entry) in entries.iter().enumerate() {
        match entry.platform {
            None => picked[idx] = true,
            Some(_) => candidates += 1,
        }
    }

    let mut matched_any = false;
    for want in &requested {
        let best = entries
            .iter()
            .enumerate()
            .filter_map(|(idx, e)| Some((idx, want.score(e.platform.as_ref()?)?)))
            // max_by_key returns the last maximum, so compare on the reversed index
            .max_by_key(|&(idx, score)| (score, std::cmp::Reverse(idx)));
        if let Some((idx, _)) = best {
            picked[idx] = true;
            matched_any = true;
        }
    }

    let unmatched = (candidates > 0 && !matched_any).then(|| PlatformUnmatched {
        image: String::new(),
        index: None,
        requested: requested.clone(),
        available: entries.iter().filter_map(|e| e.platform.clone()).collect(),
    });

    Selection {
        selected: entries
            .iter()
            .zip(picked)
            .filter(|(_, keep)| *keep)
            .map(|(entry, _)| entry.clone())
            .collect(),
        unmatched,
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn entry(n: u8, platform: Option<&str>) -> ArchiveEntry {
        ArchiveEntry {
            name: String::new(),
            media_type: "application/vnd.oci.image.manifest.v1+json".into(),
            digest: Digest::of(&[n]),
            size: 100,
            platform: platform.map(|p| p.parse().unwrap()),
        }
    }

    fn digests(selection: &Selection) -> Vec<Digest> {
        selection.selected.iter().map(|e| e.digest).collect()
    }

    #[test]
    fn test_normalization() {
        let cases = [
            ("linux/x86_64", "linux/amd64"),
            ("linux/aarch64", "linux/arm64"),
            ("linux/arm64/v8", "linux/arm64"),
            ("linux/armhf", "linux/arm/v7"),
            ("linux/arm", "linux/arm/v7"),
            ("linux/arm/6", "linux/arm/v6"),
            ("Linux/AMD64", "linux/amd64"),
            ("macos/arm64", "darwin/arm64"),
            ("windows/amd64", "windows/amd64"),
            ("linux/riscv64", "linux/riscv64"),
        ];
        for (input, expected) in cases {
            assert_eq!(input.parse::<Platform>().unwrap().to_string(), expected, "{input}");
        }
    }

    #[test]
    fn test_parse_partial_and_invalid() {
        let host = Platform::host();
        assert_eq!(
            "linux".parse::<Platform>().unwrap(),
            Platform::new("linux", host.architecture(), None)
        );
        assert_eq!(
            "s390x".parse::<Platform>().unwrap(),
            Platform::new(host.os(), "s390x", None)
        );
        for bad in ["", "linux/", "/amd64", "linux/amd64/v2/extra"] {
            assert!(bad.parse::<Platform>().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_default_selects_host() {
        let host = Platform::host().to_string();
        let entries = [
            entry(1, Some("plan9/mips")),
            entry(2, Some(&host)),
            entry(3, Some("windows/s390x")),
        ];

        let default = select(&entries, &PlatformMode::Default);
        assert_eq!(digests(&default), vec![entries[1].digest]);
        assert_eq!(default.unmatched, None);

        let all = select(&entries, &PlatformMode::All);
        assert_eq!(all.selected, entries.to_vec());
        assert_eq!(all.unmatched, None);
    }

    #[test]
    fn test_no_host_match_warns() {
        let entries = [entry(1, Some("plan9/mips")), entry(2, Some("windows/s390x"))];
        let selection = select(&entries, &PlatformMode::Default);
        assert!(selection.selected.is_empty());
        let unmatched = selection.unmatched.expect("warning");
        assert_eq!(unmatched.requested, vec![Platform::host()]);
        assert_eq!(unmatched.available.len(), 2);

        let named = unmatched.for_index("img:1", &Digest::of(b"index"));
        assert!(named.to_string().contains("in img:1"), "{named}");
    }

    #[test]
    fn test_entries_without_platform_pass() {
        let entries = [entry(1, None)];
        let selection = select(&entries, &PlatformMode::Default);
        assert_eq!(selection.selected, entries.to_vec());
        assert_eq!(selection.unmatched, None);
        assert_eq!(select(&[], &PlatformMode::Default), Selection::default());
    }

    #[test]
    fn test_variant_tie_break() {
        let entries = [
            entry(1, Some("linux/arm/v6")),
            entry(2, Some("linux/arm64")),
            entry(3, Some("linux/arm/v7")),
            entry(4, Some("linux/arm/v7")),
        ];

        let v7 = PlatformMode::Only(vec!["linux/arm/v7".parse().unwrap()]);
        assert_eq!(digests(&select(&entries, &v7)), vec![entries[2].digest]);

        let v6 = PlatformMode::Only(vec!["linux/arm/v6".parse().unwrap()]);
        assert_eq!(digests(&select(&entries, &v6)), vec![entries[0].digest]);

        // a variant-less candidate is acceptable, but an exact variant wins
        let loose = [entry(5, Some("linux/arm64")), entry(6, Some("linux/arm64/v9"))];
        let v9 = PlatformMode::Only(vec!["linux/arm64/v9".parse().unwrap()]);
        assert_eq!(digests(&select(&loose, &v9)), vec![loose[1].digest]);
        let v10 = PlatformMode::Only(vec!["linux/arm64/v10".parse().unwrap()]);
        assert_eq!(digests(&select(&loose, &v10)), vec![loose[0].digest]);
    }

    #[test]
    fn test_only_several_keeps_index_order() {
        let entries = [
            entry(1, Some("linux/amd64")),
            entry(2, Some("linux/arm64")),
            entry(3, Some("linux/ppc64le")),
        ];
        let mode = PlatformMode::Only(vec![
            "linux/ppc64le".parse().unwrap(),
            "linux/amd64".parse().unwrap(),
            "linux/amd64".parse().unwrap(),
        ]);
        assert_eq!(
            digests(&select(&entries, &mode)),
            vec![entries[0].digest, entries[2].digest]
        );
    }
}
