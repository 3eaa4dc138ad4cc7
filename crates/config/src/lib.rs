#![forbid(unsafe_code)]

mod error;
mod filter;
mod monitor;

pub use error::Error;
pub use filter::Filter;
pub use monitor::Monitor;

use serde::{Deserialize, Serialize};
use std::path::Path;
use toml_edit::{DocumentMut, Item, Table};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub monitor: Monitor,
    pub filter: Filter,
}

impl Config {
    /// Read one TOML file. Keys it leaves out keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_document(&read_document(path.as_ref())?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        std::fs::write(path, toml_edit::ser::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Layer several TOML files, later ones winning key by key. Files that
    /// do not exist are skipped.
    pub fn load_multiple<T, U>(paths: U) -> Result<Self, Error>
    where
        T: AsRef<Path>,
        U: IntoIterator<Item = T>,
    {
        let mut layered = DocumentMut::new();
        for path in paths {
            let path = path.as_ref();
            if path.exists() {
                overlay(&mut layered, read_document(path)?.as_table());
            }
        }
        Self::from_document(&layered)
    }

    fn from_document(document: &DocumentMut) -> Result<Self, Error> {
        let mut config: Config = toml_edit::de::from_str(&document.to_string())?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        // Blacklist lookups are case-insensitive.
        self.filter.normalize();
    }
}

fn read_document(path: &Path) -> Result<DocumentMut, Error> {
    Ok(std::fs::read_to_string(path)?.parse()?)
}

/// Sections merge key by key; any other value, lists included, replaces
/// what was there.
fn overlay(target: &mut Table, source: &Table) {
    for (key, item) in source.iter() {
        if let (Some(Item::Table(existing)), Item::Table(incoming)) = (target.get_mut(key), item) {
            overlay(existing, incoming);
            continue;
        }
        target.insert(key, item.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.normalize();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn load_multiple_merges() {
        let dir = tempdir().unwrap();
        let path1 = dir.path().join("a.toml");
        let path2 = dir.path().join("b.toml");

        std::fs::write(
            &path1,
            "[monitor]\npoll_interval = 250\nkill_tracked_on_stop = true\n",
        )
        .unwrap();
        std::fs::write(
            &path2,
            "[monitor]\nrecursive_kill = true\n[filter]\nblacklist = [\"Chrome.exe\"]\n",
        )
        .unwrap();

        let cfg = Config::load_multiple([path1, path2]).unwrap();
        assert_eq!(cfg.monitor.poll_interval, Duration::from_millis(250));
        assert!(cfg.monitor.kill_tracked_on_stop);
        assert!(cfg.monitor.recursive_kill);
        assert!(!cfg.filter.disable_blacklist);
        assert_eq!(cfg.filter.blacklist, vec!["chrome.exe".to_string()]);
    }

    #[test]
    fn later_blacklist_replaces_earlier_one() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("config.toml");
        let drop_in = dir.path().join("50-local.toml");
        std::fs::write(&base, "[filter]\nblacklist = [\"a.exe\", \"b.exe\"]\n").unwrap();
        std::fs::write(&drop_in, "[filter]\nblacklist = [\"c.exe\"]\n").unwrap();

        let cfg = Config::load_multiple([base, drop_in]).unwrap();
        assert_eq!(cfg.filter.blacklist, vec!["c.exe".to_string()]);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("absent.toml")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let cfg = Config::load_multiple([dir.path().join("absent.toml")]).unwrap();
        let mut expected = Config::default();
        expected.normalize();
        assert_eq!(cfg, expected);
        assert_eq!(cfg.monitor.poll_interval, Duration::from_secs(1));
    }
}
