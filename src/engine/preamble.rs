//! Script preamble composition.
//!
//! The remote shell cannot set a working directory or environment for the
//! command it runs, so both are baked into the top of each step file: a
//! directory change, then secret exports, then plain environment exports,
//! then the file's own content.

use shell_escape::unix::escape;

use super::ExecError;
use crate::spec::Step;

/// Prefixes `content` with the working directory and environment of `step`.
pub(crate) fn compose(step: &Step, content: &[u8]) -> Result<Vec<u8>, ExecError> {
    let mut preamble = String::new();
    if !step.working_dir.is_empty() {
        preamble.push_str("cd ");
        preamble.push_str(escape(step.working_dir.as_str().into()).as_ref());
        preamble.push('\n');
    }
    for secret in &step.secrets {
        let value =
            std::str::from_utf8(&secret.data).map_err(|_| ExecError::InvalidSecret {
                name: secret.name.clone(),
            })?;
        push_export(&mut preamble, &secret.env, value)?;
    }
    for (name, value) in &step.envs {
        push_export(&mut preamble, name, value)?;
    }

    let mut script = preamble.into_bytes();
    script.extend_from_slice(content);
    Ok(script)
}

fn push_export(buf: &mut String, name: &str, value: &str) -> Result<(), ExecError> {
    if !is_variable_name(name) {
        return Err(ExecError::InvalidVariable {
            name: name.to_owned(),
        });
    }
    buf.push_str("export ");
    buf.push_str(name);
    buf.push('=');
    buf.push_str(escape(value.into()).as_ref());
    buf.push('\n');
    Ok(())
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
        && chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}
