//! Shared test helpers: a scriptable stand-in for the borg binary.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tempfile::TempDir;

/// A fake borg binary backed by a shell script.
///
/// Keeps its temp directory alive for the duration of the test.
pub struct StubTool {
    _dir: TempDir,
    pub path: PathBuf,
}

impl StubTool {
    /// The binary path as a string, for `Borg::with_binary`.
    pub fn binary(&self) -> &str {
        self.path.to_str().expect("utf-8 temp path")
    }
}

/// Write an executable shell script that plays the role of borg.
///
/// The script receives the usual `--log-json --json <command> ...` argv and
/// is free to ignore it.
pub fn stub_tool(body: &str) -> StubTool {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("fake-borg");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub script");

    let mut perms = std::fs::metadata(&path).expect("stat stub").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod stub");

    StubTool { _dir: dir, path }
}

/// A marker file path inside the stub's directory, for spawn detection.
pub fn marker_path(stub: &StubTool) -> PathBuf {
    stub.path.with_file_name("spawned.marker")
}
