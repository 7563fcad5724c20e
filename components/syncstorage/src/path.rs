/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::path::{Path, PathBuf};

/// Fans a uid out into up to two directory levels built from its trailing
/// digits, so user databases spread across the filesystem instead of piling
/// into one directory. `"1234567"` maps to `["76", "54"]`: the last two
/// digits reversed-pairwise, then the preceding two.
///
/// Deterministic, and injective over valid (all-digit) uids since the file
/// name keeps the full uid.
pub fn two_level_path(uid: &str) -> Vec<String> {
    let b = uid.as_bytes();
    let mut parts = Vec::with_capacity(2);
    if b.len() >= 2 {
        parts.push(format!("{}{}", b[b.len() - 1] as char, b[b.len() - 2] as char));
    }
    if b.len() >= 4 {
        parts.push(format!("{}{}", b[b.len() - 3] as char, b[b.len() - 4] as char));
    }
    parts
}

/// Absolute location of a user's database file under `base`.
pub fn db_file(base: &Path, uid: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in two_level_path(uid) {
        path.push(part);
    }
    path.push(format!("{}.db", uid));
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_two_level_path() {
        let paths = two_level_path("1234567");
        assert_eq!(paths, vec!["76", "54"]);
    }

    #[test]
    fn test_path_and_file() {
        let base = Path::new("/tmp");
        assert_eq!(db_file(base, "12345"), Path::new("/tmp/54/32/12345.db"));
        assert_eq!(db_file(base, "123"), Path::new("/tmp/32/123.db"));
        assert_eq!(db_file(base, "7"), Path::new("/tmp/7.db"));
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(two_level_path("1234567"), two_level_path("1234567"));
    }

    #[test]
    fn test_no_collisions() {
        let base = Path::new("/base");
        let mut seen = HashSet::new();
        for uid in 0..5000u32 {
            let path = db_file(base, &uid.to_string());
            assert!(seen.insert(path), "collision for uid {}", uid);
        }
    }
}
