#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};

/// Immutable description of one observed OS process.
///
/// Equality and hashing cover every field: a snapshot is a set of these and
/// process ids are recycled by the OS, so two entries sharing an `id` are
/// still distinct processes when anything else differs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProcessInfo {
    id: u32,
    parent_id: u32,
    image_path: PathBuf,
    command_line: String,
    working_directory: Option<PathBuf>,
    creation_time: u64,
    session_id: u32,
    image_name: String,
    base_name: String,
}

impl ProcessInfo {
    pub fn new(id: u32, parent_id: u32, image_path: impl Into<PathBuf>) -> Self {
        let image_path = image_path.into();
        let (image_name, base_name) = names_of(&image_path);
        Self {
            id,
            parent_id,
            image_path,
            command_line: String::new(),
            working_directory: None,
            creation_time: 0,
            session_id: 0,
            image_name,
            base_name,
        }
    }

    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = command_line.into();
        self
    }

    pub fn with_working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    /// Creation timestamp in provider-defined monotonic units. Only the
    /// ordering between processes of the same provider is meaningful.
    pub fn with_creation_time(mut self, creation_time: u64) -> Self {
        self.creation_time = creation_time;
        self
    }

    pub fn with_session_id(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn parent_id(&self) -> u32 {
        self.parent_id
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// File name of the image, extension included (`game.exe`).
    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// File name of the image without its extension (`game`).
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// `(id, creation_time)`: identifies one process incarnation regardless of
    /// what else was read about it.
    pub fn identity(&self) -> (u32, u64) {
        (self.id, self.creation_time)
    }

    pub fn same_process(&self, other: &ProcessInfo) -> bool {
        self.identity() == other.identity()
    }

    /// Whether `name` names this image, compared case-insensitively against
    /// both [`image_name`](Self::image_name) and [`base_name`](Self::base_name).
    pub fn is_named(&self, name: &str) -> bool {
        self.image_name.eq_ignore_ascii_case(name) || self.base_name.eq_ignore_ascii_case(name)
    }
}

pub(crate) fn names_of(path: &Path) -> (String, String) {
    let image_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    (image_name, base_name)
}

impl fmt::Debug for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInfo")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("image_path", &self.image_path)
            .field("creation_time", &self.creation_time)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.image_name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_derived_from_the_image_path() {
        let info = ProcessInfo::new(7, 1, "/opt/games/Game_x64.exe");
        assert_eq!(info.image_name(), "Game_x64.exe");
        assert_eq!(info.base_name(), "Game_x64");
        assert!(info.is_named("game_x64.EXE"));
        assert!(info.is_named("GAME_X64"));
        assert!(!info.is_named("game"));
    }

    #[test]
    fn recycled_id_is_a_different_value() {
        let first = ProcessInfo::new(42, 1, "/bin/a").with_creation_time(10);
        let second = ProcessInfo::new(42, 1, "/bin/a").with_creation_time(11);
        assert_ne!(first, second);
        assert!(!first.same_process(&second));

        let reread = first.clone().with_command_line("a --flag");
        assert_ne!(first, reread);
        assert!(first.same_process(&reread));
    }
}
