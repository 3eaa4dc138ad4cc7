#![forbid(unsafe_code)]

use crate::snapshot::ProcessInfo;
use std::path::{Path, PathBuf};

/// A launch that was requested before any OS process exists for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLaunch {
    expected_image: PathBuf,
    expected_base_name: String,
}

impl PendingLaunch {
    /// `expected_image` is either a full image path or a bare image name.
    pub fn new(expected_image: impl Into<PathBuf>) -> Self {
        let expected_image = expected_image.into();
        let expected_base_name = expected_image
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            expected_image,
            expected_base_name,
        }
    }

    pub fn expected_image(&self) -> &Path {
        &self.expected_image
    }

    pub fn expected_base_name(&self) -> &str {
        &self.expected_base_name
    }

    /// Exact image path, or the expected base name contained in the observed
    /// one (`Game` matches `Game_x64`).
    pub fn matches(&self, info: &ProcessInfo) -> bool {
        info.image_path() == self.expected_image
            || fuzzy_image_match(&self.expected_base_name, info.base_name())
    }
}

/// Whether the longest common substring of `expected` and `observed` is all
/// of `expected`, ignoring case.
pub fn fuzzy_image_match(expected: &str, observed: &str) -> bool {
    match longest_common_substring(expected, observed) {
        Some(common) => common == expected.to_lowercase(),
        None => false,
    }
}

/// Longest common substring of the lower-cased inputs. `None` when they
/// share no character. Ties go to the earliest occurrence in `a`.
pub fn longest_common_substring(a: &str, b: &str) -> Option<String> {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() || b.is_empty() {
        return None;
    }

    // run[j + 1]: length of the common run ending at a[i] and b[j].
    let mut run = vec![0usize; b.len() + 1];
    let mut best_len = 0;
    let mut best_end = 0;
    for (i, ca) in a.iter().enumerate() {
        for j in (0..b.len()).rev() {
            if *ca == b[j] {
                run[j + 1] = run[j] + 1;
                if run[j + 1] > best_len {
                    best_len = run[j + 1];
                    best_end = i + 1;
                }
            } else {
                run[j + 1] = 0;
            }
        }
    }

    (best_len > 0).then(|| a[best_end - best_len..best_end].iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn launcher_suffix_still_matches() {
        let launch = PendingLaunch::new("HeroesOfTheStorm");
        let observed = ProcessInfo::new(5, 1, "C:/Games/HeroesOfTheStorm_x64.exe");
        assert!(launch.matches(&observed));
    }

    #[test]
    fn exact_path_matches() {
        let launch = PendingLaunch::new("/opt/game/bin/run");
        assert!(launch.matches(&ProcessInfo::new(5, 1, "/opt/game/bin/run")));
    }

    #[test]
    fn partial_overlap_does_not_match() {
        let launch = PendingLaunch::new("Game.exe");
        assert!(!launch.matches(&ProcessInfo::new(5, 1, "/bin/gam")));
        assert!(!launch.matches(&ProcessInfo::new(5, 1, "/bin/xyz")));
        assert!(launch.matches(&ProcessInfo::new(5, 1, "/bin/GAME_x64.exe")));
    }

    #[test]
    fn empty_expectation_never_matches() {
        assert!(!fuzzy_image_match("", "anything"));
        assert_eq!(longest_common_substring("abc", ""), None);
        assert_eq!(longest_common_substring("abc", "xyz"), None);
    }

    #[test]
    fn common_substring_is_found() {
        assert_eq!(
            longest_common_substring("xxHeroesyy", "heroes_x64").as_deref(),
            Some("heroes")
        );
    }

    proptest! {
        #[test]
        fn contained_name_always_matches(
            prefix in "[a-z_]{0,6}",
            name in "[A-Za-z]{1,12}",
            suffix in "[a-z_0-9]{0,6}",
        ) {
            let observed = format!("{prefix}{}{suffix}", name.to_uppercase());
            prop_assert!(fuzzy_image_match(&name, &observed));
        }

        #[test]
        fn common_substring_occurs_in_both(a in "[a-d]{0,10}", b in "[a-d]{0,10}") {
            if let Some(common) = longest_common_substring(&a, &b) {
                prop_assert!(a.contains(&common));
                prop_assert!(b.contains(&common));
            }
        }
    }
}
