use crate::error::CommonError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Checks `bytes` against an expected hex digest. Comparison ignores case.
pub fn verify_sha256(file: &str, bytes: &[u8], expected: &str) -> Result<(), CommonError> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            file: file.to_string(),
            expected: expected.trim().to_lowercase(),
            actual,
        })
    }
}

/// Parses a `SHA256SUMS`-style listing into a file name -> digest map.
///
/// Accepts both the coreutils layout (`<hash>  <file>`, with an optional
/// `*` binary marker) and the BSD layout (`SHA256 (<file>) = <hash>`).
pub fn parse_checksum_file(content: &str) -> HashMap<String, String> {
    let mut listing = HashMap::new();

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((file, hash)) = parse_bsd_line(line) {
            listing.insert(file, hash);
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(hash), Some(file)) = (fields.next(), fields.next()) else {
            continue;
        };
        let file = file.trim_start_matches('*').trim_start_matches("./");
        if !file.is_empty() {
            listing.insert(file.to_string(), hash.to_lowercase());
        }
    }

    listing
}

fn parse_bsd_line(line: &str) -> Option<(String, String)> {
    let (algo, rest) = line.split_once('(')?;
    if !algo.trim().eq_ignore_ascii_case("sha256") {
        return None;
    }
    let (file, tail) = rest.split_once(')')?;
    let (_, hash) = tail.split_once('=')?;
    let file = file.trim().trim_start_matches("./");
    let hash = hash.trim();
    if file.is_empty() || hash.is_empty() {
        return None;
    }
    Some((file.to_string(), hash.to_lowercase()))
}

/// Looks up `file` in a parsed listing and verifies `bytes` against it.
pub fn verify_listed(
    listing: &HashMap<String, String>,
    file: &str,
    bytes: &[u8],
) -> Result<(), CommonError> {
    let expected = listing
        .get(file)
        .ok_or_else(|| CommonError::ChecksumMissing {
            file: file.to_string(),
        })?;
    verify_sha256(file, bytes, expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn sha256_of_hello() {
        assert_eq!(sha256_hex(b"hello"), HELLO);
    }

    #[test]
    fn parses_both_listing_layouts() {
        let content = format!(
            "# generated\n\
             {HELLO}  ubuntu-core-12.04.3-core-amd64.tar.gz\n\
             SHA256 (fedora-20-x86.tar.gz) = {}\n\
             {HELLO} *./debian-7.0-x86-minimal.tar.gz\n",
            HELLO.to_uppercase()
        );

        let listing = parse_checksum_file(&content);
        assert_eq!(listing.len(), 3);
        assert_eq!(
            listing.get("ubuntu-core-12.04.3-core-amd64.tar.gz").map(String::as_str),
            Some(HELLO)
        );
        assert_eq!(
            listing.get("fedora-20-x86.tar.gz").map(String::as_str),
            Some(HELLO)
        );
        assert_eq!(
            listing.get("debian-7.0-x86-minimal.tar.gz").map(String::as_str),
            Some(HELLO)
        );
    }

    #[test]
    fn verify_reports_mismatch() {
        let err = verify_sha256("rootfs.tar.gz", b"tampered", HELLO).unwrap_err();
        match err {
            CommonError::ChecksumMismatch { file, expected, .. } => {
                assert_eq!(file, "rootfs.tar.gz");
                assert_eq!(expected, HELLO);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn verify_listed_requires_entry() {
        let listing = parse_checksum_file(&format!("{HELLO}  other.tar.gz\n"));
        assert!(matches!(
            verify_listed(&listing, "rootfs.tar.gz", b"hello"),
            Err(CommonError::ChecksumMissing { .. })
        ));
        assert!(verify_listed(&listing, "other.tar.gz", b"hello").is_ok());
    }
}
