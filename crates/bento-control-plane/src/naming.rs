//! Deterministic names for storage objects, image tags and build resources.
//!
//! Everything here is pure. The same (org, bento, version) triple always
//! yields the same names.
use sha2::{Digest, Sha256};

/// Top-level key prefix for uploaded bento archives.
pub const OBJECT_COLLECTION: &str = "bentos";
/// Tag prefix for built images.
pub const IMAGE_TAG_PREFIX: &str = "yatai";
/// Name prefix for image builder jobs.
pub const IMAGE_BUILDER_PREFIX: &str = "yatai-image-builder";
/// DNS-1123 label limit enforced by the Kubernetes API server.
pub const MAX_KUBE_NAME_LEN: usize = 63;

const HASH_SUFFIX_LEN: usize = 8;

pub fn s3_object_name(org: &str, bento: &str, version: &str) -> String {
    format!("{OBJECT_COLLECTION}/{org}/{bento}/{version}.tar.gz")
}

pub fn image_name(registry_uri: &str, org: &str, bento: &str, version: &str) -> String {
    format!("{registry_uri}:{IMAGE_TAG_PREFIX}.{org}.{bento}.{version}")
}

pub fn image_builder_job_name(org: &str, bento: &str, version: &str) -> String {
    kube_name(&format!("{IMAGE_BUILDER_PREFIX}-{org}-{bento}-{version}"))
}

/// Kebab-case `raw` into a valid Kubernetes object name.
///
/// Lowercases, splits camelCase and letter/digit boundaries, maps every other character
/// (dots included) to `-` and collapses runs. Results over 63 characters
/// are cut and suffixed with a short SHA-256 of the full kebab form so two
/// long inputs sharing a prefix still differ.
pub fn kube_name(raw: &str) -> String {
    let kebab = to_kebab(raw);
    if kebab.len() <= MAX_KUBE_NAME_LEN { return kebab; }
    let digest = hex::encode(Sha256::digest(kebab.as_bytes()));
    let keep = MAX_KUBE_NAME_LEN - HASH_SUFFIX_LEN - 1;
    let head = kebab[..keep].trim_end_matches('-');
    format!("{head}-{}", &digest[..HASH_SUFFIX_LEN])
}

/// `resnet50` becomes `resnet-50` and `JSONParser` becomes `json-parser`.
fn to_kebab(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !out.ends_with('-') { out.push('-'); }
            continue;
        }
        let prev = i.checked_sub(1).map(|j| chars[j]).filter(|p| p.is_ascii_alphanumeric());
        let next = chars.get(i + 1).copied();
        let boundary = prev.is_some_and(|p| {
            (c.is_ascii_uppercase() && (p.is_ascii_lowercase() || p.is_ascii_digit()))
                || (c.is_ascii_uppercase() && p.is_ascii_uppercase() && next.is_some_and(|n| n.is_ascii_lowercase()))
                || (c.is_ascii_digit() && p.is_ascii_alphabetic())
                || (c.is_ascii_alphabetic() && p.is_ascii_digit())
        });
        if boundary { out.push('-'); }
        out.push(c.to_ascii_lowercase());
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_name_layout() {
        assert_eq!(s3_object_name("acme", "resnet", "1.0.0"), "bentos/acme/resnet/1.0.0.tar.gz");
    }

    #[test]
    fn image_name_layout() {
        assert_eq!(
            image_name("123.dkr.ecr.us-west-2.amazonaws.com/bentos", "acme", "resnet", "1.0.0"),
            "123.dkr.ecr.us-west-2.amazonaws.com/bentos:yatai.acme.resnet.1.0.0"
        );
    }

    #[test]
    fn job_name_has_no_dots() {
        let name = image_builder_job_name("acme", "resnet", "1.0.0");
        assert_eq!(name, "yatai-image-builder-acme-resnet-1-0-0");
        assert!(!name.contains('.'));
    }

    #[test]
    fn kebab_splits_camel_case_and_underscores() {
        assert_eq!(kube_name("MyOrg_fraudDetector.v2"), "my-org-fraud-detector-v-2");
        assert_eq!(kube_name("--a..b--"), "a-b");
    }

    #[test]
    fn kebab_splits_letters_from_digits() {
        assert_eq!(kube_name("resnet50"), "resnet-50");
        assert_eq!(kube_name("numbers2And55with000"), "numbers-2-and-55-with-000");
        assert_eq!(kube_name("JSONParser"), "json-parser");
        assert_eq!(image_builder_job_name("acme", "resnet50", "v1.2"), "yatai-image-builder-acme-resnet-50-v-1-2");
    }

    #[test]
    fn names_are_stable() {
        for _ in 0..3 {
            assert_eq!(image_builder_job_name("acme", "resnet", "1.0.0"), image_builder_job_name("acme", "resnet", "1.0.0"));
            assert_eq!(s3_object_name("o", "b", "v"), s3_object_name("o", "b", "v"));
        }
    }

    #[test]
    fn long_names_are_truncated_with_hash() {
        let version = "2024.01.01-".repeat(8);
        let a = image_builder_job_name("acme", "resnet", &format!("{version}a"));
        let b = image_builder_job_name("acme", "resnet", &format!("{version}b"));
        assert!(a.len() <= MAX_KUBE_NAME_LEN, "{a}");
        assert!(b.len() <= MAX_KUBE_NAME_LEN, "{b}");
        assert_ne!(a, b);
        assert!(a.starts_with("yatai-image-builder-acme-resnet-2024-01-01"));
        assert!(!a.ends_with('-'));
    }
}
