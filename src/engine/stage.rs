//! Workspace staging over the file transfer channel.

use tracing::trace;

use super::StageError;
use crate::remote::RemoteSession;
use crate::spec::File;

/// Creates every directory entry, then uploads every file entry.
///
/// Directories go first because files may be nested under them. The first
/// failure aborts staging.
pub(crate) fn stage<S: RemoteSession + ?Sized>(
    session: &mut S,
    files: &[File],
) -> Result<(), StageError> {
    for dir in files.iter().filter(|file| file.is_dir) {
        trace!(path = %dir.path, mode = dir.mode, "create directory");
        session
            .create_dir_all(&dir.path)
            .map_err(|source| StageError::Directory {
                path: dir.path.clone(),
                source,
            })?;
        chmod(session, &dir.path, dir.mode)?;
    }
    for file in files.iter().filter(|file| !file.is_dir) {
        upload(session, &file.path, &file.data, file.mode)?;
    }
    Ok(())
}

/// Writes `data` to `path` and then applies `mode`.
///
/// The transfer channel cannot set permissions as part of the write.
pub(crate) fn upload<S: RemoteSession + ?Sized>(
    session: &mut S,
    path: &str,
    data: &[u8],
    mode: u32,
) -> Result<(), StageError> {
    trace!(path, mode, bytes = data.len(), "upload file");
    session
        .write_file(path, data)
        .map_err(|source| StageError::Upload {
            path: path.to_owned(),
            source,
        })?;
    chmod(session, path, mode)
}

fn chmod<S: RemoteSession + ?Sized>(
    session: &mut S,
    path: &str,
    mode: u32,
) -> Result<(), StageError> {
    session
        .chmod(path, mode)
        .map_err(|source| StageError::Permissions {
            path: path.to_owned(),
            mode,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use crate::test_support::{FakeSession, SessionOp};
    use rstest::rstest;

    #[rstest]
    fn directories_are_created_before_files() {
        let mut session = FakeSession::default();
        let files = vec![
            File::file("/tmp/source/README", 0o644, "hello"),
            File::dir("/tmp/source", 0o700),
        ];

        stage(&mut session, &files).expect("stage succeeds");

        assert_eq!(
            session.ops(),
            vec![
                SessionOp::CreateDir(String::from("/tmp/source")),
                SessionOp::Chmod(String::from("/tmp/source"), 0o700),
                SessionOp::Write(String::from("/tmp/source/README"), b"hello".to_vec()),
                SessionOp::Chmod(String::from("/tmp/source/README"), 0o644),
            ]
        );
    }

    #[rstest]
    fn upload_failure_aborts_staging() {
        let mut session = FakeSession::default().fail_write_on("/tmp/a");
        let files = vec![
            File::file("/tmp/a", 0o600, "a"),
            File::file("/tmp/b", 0o600, "b"),
        ];

        let err = stage(&mut session, &files).expect_err("stage should fail");

        assert!(
            matches!(
                err,
                StageError::Upload {
                    ref path,
                    source: RemoteError::Transfer { .. },
                } if path == "/tmp/a"
            ),
            "unexpected error: {err}"
        );
        assert!(
            !session
                .ops()
                .iter()
                .any(|op| matches!(op, SessionOp::Write(path, _) if path == "/tmp/b")),
            "second file must not be written"
        );
    }
}
