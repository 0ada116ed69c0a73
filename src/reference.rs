//! Naming of imported images.
//!
//! Archive entries may or may not carry a human readable reference.  Untagged entries still need
//! a stable, addressable name, which is derived from the content digest and the namespace the
//! images are unpacked into: `<namespace>@sha256:<hex>`.

use crate::digest::Digest;

/// When to register a digest-derived name for an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DigestRefPolicy {
    /// Only entries without a name get a digest-derived one.
    #[default]
    KeepIfNamed,
    /// Every entry gets a digest-derived name, in addition to its own name if it has one.
    AlwaysDerive,
}

/// Maps the reference found in an archive to the name(s) the image is registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestTranslator {
    namespace: String,
    policy: DigestRefPolicy,
}

impl DigestTranslator {
    pub fn new(namespace: impl Into<String>, policy: DigestRefPolicy) -> Self {
        Self {
            namespace: namespace.into(),
            policy,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn policy(&self) -> DigestRefPolicy {
        self.policy
    }

    /// The name derived from `digest` alone.
    pub fn digest_ref(&self, digest: &Digest) -> String {
        if self.namespace.is_empty() {
            digest.to_string()
        } else {
            format!("{}@{digest}", self.namespace)
        }
    }

    /// The canonical name for an entry.  Never empty.
    pub fn translate(&self, name: &str, digest: &Digest) -> String {
        match self.policy {
            DigestRefPolicy::KeepIfNamed if !name.is_empty() => name.to_string(),
            _ => self.digest_ref(digest),
        }
    }

    /// Every name an entry gets registered under, canonical name last.
    ///
    /// Under [`DigestRefPolicy::KeepIfNamed`] this is exactly one name.
    pub fn names(&self, name: &str, digest: &Digest) -> Vec<String> {
        match self.policy {
            DigestRefPolicy::AlwaysDerive if !name.is_empty() => {
                vec![name.to_string(), self.digest_ref(digest)]
            }
            _ => vec![self.translate(name, digest)],
        }
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn digest() -> Digest {
        Digest::of(b"manifest")
    }

    #[test]
    fn test_translate_table() {
        let d = digest();
        let cases = [
            (DigestRefPolicy::KeepIfNamed, "native", "myimage:latest", "myimage:latest".to_string()),
            (DigestRefPolicy::KeepIfNamed, "native", "", format!("native@{d}")),
            (DigestRefPolicy::KeepIfNamed, "", "", d.to_string()),
            (DigestRefPolicy::AlwaysDerive, "native", "myimage:latest", format!("native@{d}")),
            (DigestRefPolicy::AlwaysDerive, "native", "", format!("native@{d}")),
        ];
        for (policy, namespace, name, expected) in cases {
            let translator = DigestTranslator::new(namespace, policy);
            assert_eq!(translator.translate(name, &d), expected, "{policy:?} {namespace:?} {name:?}");
        }
    }

    #[test]
    fn test_untagged_names_are_stable_and_distinct() {
        let translator = DigestTranslator::new("default", DigestRefPolicy::KeepIfNamed);
        let a = translator.translate("", &digest());
        assert!(!a.is_empty());
        assert_eq!(a, translator.translate("", &digest()));
        assert!(a != translator.translate("", &Digest::of(b"another manifest")));
    }

    #[test]
    fn test_names() {
        let d = digest();
        let keep = DigestTranslator::new("default", DigestRefPolicy::KeepIfNamed);
        assert_eq!(keep.names("img:1", &d), vec!["img:1".to_string()]);
        assert_eq!(keep.names("", &d), vec![format!("default@{d}")]);

        let always = DigestTranslator::new("default", DigestRefPolicy::AlwaysDerive);
        assert_eq!(
            always.names("img:1", &d),
            vec!["img:1".to_string(), format!("default@{d}")]
        );
        assert_eq!(always.names("", &d), vec![format!("default@{d}")]);
    }
}
