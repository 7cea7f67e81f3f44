//! Reading pipeline documents and compiled specifications from disk.
//!
//! Both inputs are JSON. Files are opened through `cap-std` relative to their
//! parent directory so a path like `pipeline.json` resolves against the
//! working directory.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::compiler::PipelineDocument;
use crate::spec::Spec;

/// Errors raised while loading a JSON input file.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Raised when the path is empty or only whitespace.
    #[error("input path must not be empty")]
    EmptyPath,
    /// Raised when the file cannot be read.
    #[error("failed to read `{path}`: {message}")]
    Read {
        /// Path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the content is not the expected JSON shape.
    #[error("failed to parse `{path}`: {source}")]
    Parse {
        /// Path whose content failed to parse.
        path: String,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

/// Loads a pipeline document.
///
/// # Errors
///
/// Returns [`ManifestError`] when the file is missing or malformed.
pub fn load_pipeline(path: &Utf8Path) -> Result<PipelineDocument, ManifestError> {
    load_json(path)
}

/// Loads a compiled specification.
///
/// # Errors
///
/// Returns [`ManifestError`] when the file is missing or malformed.
pub fn load_spec(path: &Utf8Path) -> Result<Spec, ManifestError> {
    load_json(path)
}

fn load_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, ManifestError> {
    if path.as_str().trim().is_empty() {
        return Err(ManifestError::EmptyPath);
    }
    let content = read_to_string_ambient(path).map_err(|message| ManifestError::Read {
        path: path.to_string(),
        message,
    })?;
    serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
        path: path.to_string(),
        source,
    })
}

fn read_to_string_ambient(path: &Utf8Path) -> Result<String, String> {
    let (dir_path, file_path) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(file_name)) if !parent.as_str().is_empty() => {
            (parent, Utf8Path::new(file_name))
        }
        _ => (Utf8Path::new("."), path),
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join(name)).expect("utf-8 temp path");
        std::fs::write(&path, content).expect("write fixture");
        path
    }

    #[rstest]
    fn loads_pipeline_documents() {
        let dir = TempDir::new().expect("temp dir");
        let path = write(
            &dir,
            "pipeline.json",
            r#"{"clone":{"disable":true,"ref":"refs/heads/main"},"steps":[{"name":"build","commands":["make"],"run_policy":"always"}]}"#,
        );

        let document = load_pipeline(&path).expect("document loads");

        assert!(document.clone.disable);
        assert_eq!(document.clone.reference, "refs/heads/main");
        let step = document.steps.first().expect("one step");
        assert_eq!(step.commands, vec![String::from("make")]);
        assert_eq!(step.run_policy, Some(crate::spec::RunPolicy::Always));
    }

    #[rstest]
    fn loads_compiled_specs() {
        let dir = TempDir::new().expect("temp dir");
        let path = write(
            &dir,
            "spec.json",
            r#"{"name":"drone-abc","settings":{"image":"catalina.img","compute":6,"username":"admin","password":"admin"},"steps":[{"name":"build","command":"/bin/sh"}]}"#,
        );

        let spec = load_spec(&path).expect("spec loads");

        assert_eq!(spec.name, "drone-abc");
        assert_eq!(spec.settings.compute, 6);
        assert_eq!(spec.address(), None);
        assert_eq!(spec.steps.len(), 1);
    }

    #[rstest]
    fn missing_files_report_the_path() {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("absent.json")).expect("utf-8 path");

        let err = load_spec(&path).expect_err("missing file");

        assert!(matches!(err, ManifestError::Read { .. }), "unexpected error: {err}");
        assert!(err.to_string().contains("absent.json"), "message: {err}");
    }

    #[rstest]
    fn malformed_json_is_a_parse_error() {
        let dir = TempDir::new().expect("temp dir");
        let path = write(&dir, "broken.json", "{ not json");

        let err = load_pipeline(&path).expect_err("malformed file");

        assert!(matches!(err, ManifestError::Parse { .. }), "unexpected error: {err}");
    }

    #[rstest]
    fn empty_paths_are_rejected() {
        let err = load_spec(Utf8Path::new("  ")).expect_err("empty path");
        assert!(matches!(err, ManifestError::EmptyPath));
    }
}
