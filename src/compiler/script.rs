//! Shell script generation for step and clone commands.

use std::borrow::Cow;

use shell_escape::unix::escape;

use super::CloneSettings;

/// Renders `commands` as a POSIX script that stops at the first failure and
/// traces each command before running it.
pub(crate) fn script<S: AsRef<str>>(commands: &[S]) -> String {
    let mut buf = String::from("set -e\n");
    for entry in commands {
        let command = entry.as_ref();
        buf.push_str("\necho + ");
        buf.push_str(escape(Cow::Borrowed(command)).as_ref());
        buf.push('\n');
        buf.push_str(command);
        buf.push('\n');
    }
    buf
}

/// Returns the git commands that populate the workspace.
pub(crate) fn clone_commands(clone: &CloneSettings) -> Vec<String> {
    let remote = escape(Cow::Borrowed(clone.remote.as_str())).into_owned();
    let branch = escape(Cow::Borrowed(clone.branch.as_str())).into_owned();
    let commit = escape(Cow::Borrowed(clone.commit.as_str())).into_owned();
    let reference = escape(Cow::Borrowed(clone.reference.as_str())).into_owned();

    let mut commands = vec![
        String::from("git init"),
        format!("git remote add origin {remote}"),
    ];
    if clone.reference.starts_with("refs/tags/") {
        commands.push(format!("git fetch origin +{reference}:"));
        commands.push(String::from("git checkout -qf FETCH_HEAD"));
    } else if clone.reference.starts_with("refs/pull/")
        || clone.reference.starts_with("refs/merge-requests/")
    {
        commands.push(format!("git fetch origin +refs/heads/{branch}:"));
        commands.push(format!("git checkout {branch}"));
        commands.push(format!("git fetch origin {reference}:"));
        commands.push(format!("git merge {commit}"));
    } else {
        commands.push(format!("git fetch origin +refs/heads/{branch}:"));
        commands.push(format!("git checkout {commit} -b {branch}"));
    }
    commands
}

/// Turns a step name into a file-name-safe slug.
pub(crate) fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        out.push_str("step");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn script_traces_each_command() {
        let rendered = script(&["go build", "go test ./..."]);
        assert_eq!(
            rendered,
            "set -e\n\necho + 'go build'\ngo build\n\necho + 'go test ./...'\ngo test ./...\n"
        );
    }

    #[rstest]
    #[case("Build", "build")]
    #[case("unit tests", "unit-tests")]
    #[case("  lint / fmt  ", "lint-fmt")]
    #[case("release_v2", "release-v2")]
    #[case("!!!", "step")]
    fn slugs_are_file_name_safe(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(slug(name), expected);
    }

    fn clone_settings(reference: &str) -> CloneSettings {
        CloneSettings {
            disable: false,
            remote: String::from("https://github.com/octocat/hello-world.git"),
            branch: String::from("main"),
            commit: String::from("7fd1a60"),
            reference: reference.to_owned(),
        }
    }

    #[rstest]
    fn branch_clone_checks_out_commit() {
        let commands = clone_commands(&clone_settings("refs/heads/main"));
        assert_eq!(commands.first().map(String::as_str), Some("git init"));
        assert!(
            commands
                .get(1)
                .is_some_and(|command| command.starts_with("git remote add origin ")),
            "commands: {commands:?}"
        );
        assert_eq!(
            commands.get(2..),
            Some(
                &[
                    String::from("git fetch origin +refs/heads/main:"),
                    String::from("git checkout 7fd1a60 -b main"),
                ][..]
            )
        );
    }

    #[rstest]
    fn tag_clone_checks_out_fetch_head() {
        let commands = clone_commands(&clone_settings("refs/tags/v1.0.0"));
        assert_eq!(
            commands.get(2).map(String::as_str),
            Some("git fetch origin +refs/tags/v1.0.0:")
        );
        assert_eq!(commands.get(3).map(String::as_str), Some("git checkout -qf FETCH_HEAD"));
    }

    #[rstest]
    fn pull_request_clone_merges_commit() {
        let commands = clone_commands(&clone_settings("refs/pull/42/head"));
        assert_eq!(commands.last().map(String::as_str), Some("git merge 7fd1a60"));
        assert!(commands.contains(&String::from("git fetch origin refs/pull/42/head:")));
    }
}
