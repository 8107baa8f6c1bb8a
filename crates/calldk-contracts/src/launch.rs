use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const PROJECT_DIRECTORY_FLAG: &str = "--project-directory";
pub const PROMPT_FLAG: &str = "--prompt";
pub const OUTPUT_FILE_FLAG: &str = "--output-file";

/// Parameters for one dialog launch. Built per handoff, consumed once by the
/// dialog frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub project_directory: String,
    pub prompt_summary: String,
    pub output_path: PathBuf,
}

impl LaunchSpec {
    pub fn new(
        project_directory: impl Into<String>,
        prompt_summary: impl Into<String>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            project_directory: project_directory.into(),
            prompt_summary: prompt_summary.into(),
            output_path: output_path.into(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Command-line arguments in the order the frontend expects them.
    pub fn to_args(&self) -> Vec<OsString> {
        vec![
            OsString::from(PROJECT_DIRECTORY_FLAG),
            OsString::from(&self.project_directory),
            OsString::from(PROMPT_FLAG),
            OsString::from(&self.prompt_summary),
            OsString::from(OUTPUT_FILE_FLAG),
            self.output_path.clone().into_os_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::LaunchSpec;

    #[test]
    fn to_args_orders_flags_and_values() {
        let spec = LaunchSpec::new(".", "call dk", "/tmp/out.json");
        let args = spec.to_args();
        assert_eq!(
            args,
            vec![
                OsString::from("--project-directory"),
                OsString::from("."),
                OsString::from("--prompt"),
                OsString::from("call dk"),
                OsString::from("--output-file"),
                OsString::from("/tmp/out.json"),
            ]
        );
    }
}
