use fact_checker_host_lib::session::config::ProcessCommand;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Backend that is ready immediately and stays up
pub const READY_SERVICE: &str = r#"
touch "$(dirname "$0")/service.spawned"
echo booting
echo '[READY]'
exec sleep 600
"#;

/// Backend that needs half a second before it is ready
pub const SLOW_SERVICE: &str = r#"
sleep 0.5
echo '[READY]'
exec sleep 600
"#;

/// Backend that exits with code 9 once `crash` appears next to it
pub const CRASHABLE_SERVICE: &str = r#"
dir="$(dirname "$0")"
echo '[READY]'
while [ ! -f "$dir/crash" ]; do sleep 0.05; done
exit 9
"#;

/// Capture client that records its scripted answers, then records forever
pub const RECORDING_CAPTURE: &str = r#"
read code
read target
echo "$code|$target" > "$(dirname "$0")/capture.args"
echo '[CAPTURE] Recording'
exec sleep 600
"#;

/// Capture client that exits with code 5 once `capture.crash` appears
pub const CRASHABLE_CAPTURE: &str = r#"
dir="$(dirname "$0")"
read code
read target
echo '[CAPTURE] Recording'
while [ ! -f "$dir/capture.crash" ]; do sleep 0.05; done
exit 5
"#;

/// Capture client that takes a while before recording; each launch is
/// appended to `capture.starts`
pub const SLOW_CAPTURE: &str = r#"
echo launched >> "$(dirname "$0")/capture.starts"
read code
read target
sleep 1
echo '[CAPTURE] Recording'
exec sleep 600
"#;

/// Scratch directory holding fake child scripts
pub struct ScriptDir {
    dir: TempDir,
}

impl ScriptDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create script dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, body: &str) -> PathBuf {
        let path = self.file(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("write script");
        path
    }

    /// Run the script through `sh` so no exec bit is needed
    pub fn command(&self, name: &str, body: &str) -> ProcessCommand {
        let path = self.write(name, body);
        ProcessCommand::new("sh").arg(path.to_string_lossy().to_string())
    }

    pub fn touch(&self, name: &str) {
        std::fs::write(self.file(name), b"").expect("touch trigger file");
    }
}
