//! Shared utility functions for the evs supervisor.

use std::path::{Component, Path, PathBuf};
use std::process::Command;

/// Apply platform-specific flags to hide the console window of helper
/// commands (e.g. `taskkill`) on Windows. No-op elsewhere.
#[cfg(target_os = "windows")]
pub fn hide_console_window(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn hide_console_window(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Make `path` absolute (relative to the current directory) and lexically
/// clean it: `.` segments are dropped and `..` pops the previous segment.
/// The filesystem is not consulted, so symlinks are left alone.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // 루트 위로는 올라가지 않음
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Case-insensitive comparison of two paths after normalisation.
pub fn same_executable(a: &Path, b: &Path) -> bool {
    let a = normalize_path(a);
    let b = normalize_path(b);
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}

/// Rough terminal display width: ASCII counts 1, anything else 2.
pub fn display_width(s: &str) -> usize {
    s.chars().map(|c| if c.is_ascii() { 1 } else { 2 }).sum()
}
