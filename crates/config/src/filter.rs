use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Filter {
    /// Ignore [`Filter::blacklist`] entirely. Per-tree filters given by the
    /// launcher still apply.
    pub disable_blacklist: bool,

    /// Image names that are never attached to a tracked tree, even when
    /// their parent is tracked. Entries are compared case-insensitively
    /// against both the file name (`chrome.exe`) and the base name
    /// (`chrome`) of a newly observed process.
    ///
    /// Typical candidates are helpers that every application spawns and that
    /// outlive their parent, such as crash reporters.
    pub blacklist: Vec<String>,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            disable_blacklist: false,
            blacklist: vec![
                "chrome_crashpad_handler".into(),
                "conhost.exe".into(),
                "crashpad_handler".into(),
                "werfault.exe".into(),
            ],
        }
    }
}

impl Filter {
    /// Lower-case, sort and deduplicate the blacklist.
    pub fn normalize(&mut self) {
        for name in &mut self.blacklist {
            *name = name.trim().to_lowercase();
        }
        self.blacklist.retain(|name| !name.is_empty());
        self.blacklist.sort();
        self.blacklist.dedup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalize_folds_case_and_duplicates() {
        let mut filter = Filter {
            disable_blacklist: false,
            blacklist: vec!["Chrome.EXE".into(), " chrome.exe".into(), "".into()],
        };
        filter.normalize();
        assert_eq!(filter.blacklist, vec!["chrome.exe".to_string()]);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(names in prop::collection::vec("[A-Za-z_. ]{0,12}", 0..20)) {
            let mut once = Filter { disable_blacklist: false, blacklist: names };
            once.normalize();
            let mut twice = once.clone();
            twice.normalize();
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.blacklist.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
