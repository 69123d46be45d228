//! Name/input validators, grounded on `distribution/src/utils/validation.rs`'s
//! regex-based `is_valid_*` helpers.

use regex::Regex;
use std::sync::LazyLock;

static DEVICE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Device names must be alphanumeric plus `_`/`-`, at most 20 characters
/// (spec.md §3 "Device", to fit inside the container name and port-mapping
/// scheme derived from it).
pub fn is_valid_device_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 20 && DEVICE_NAME_RE.is_match(name)
}

pub fn is_valid_image_filename(name: &str, allowed_exts: &[&str]) -> bool {
    if name.is_empty() || name.contains('/') || name.contains("..") {
        return false;
    }
    allowed_exts.iter().any(|ext| name.ends_with(ext))
}

pub fn is_valid_apk_filename(name: &str) -> bool {
    is_valid_image_filename(name, &[".apk"])
}

pub fn is_valid_system_image_filename(name: &str) -> bool {
    is_valid_image_filename(name, &[".zip"])
}

pub fn is_valid_cvd_image_filename(name: &str) -> bool {
    is_valid_image_filename(name, &[".tar.gz", ".tar"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(is_valid_device_name("pixel6-api33"));
        assert!(is_valid_device_name("a"));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(!is_valid_device_name(""));
        assert!(!is_valid_device_name("has a space"));
        assert!(!is_valid_device_name("has/slash"));
        assert!(!is_valid_device_name(&"x".repeat(21)));
    }

    #[test]
    fn validates_image_extensions() {
        assert!(is_valid_system_image_filename("aosp-main.zip"));
        assert!(!is_valid_system_image_filename("aosp-main.tar"));
        assert!(is_valid_cvd_image_filename("cvd-host.tar.gz"));
        assert!(is_valid_apk_filename("demo.apk"));
        assert!(!is_valid_apk_filename("../../etc/passwd.apk"));
    }
}
