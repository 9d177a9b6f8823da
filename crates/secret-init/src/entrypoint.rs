// SPDX-License-Identifier: AGPL-3.0-only

//! Entrypoint extraction: split our argv into the child binary and its
//! arguments, resolving the binary against PATH.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Extract the child entrypoint from this process's argument list.
/// `args[0]` is our own name; `args[1]` names the binary to run and the
/// rest is passed through verbatim.
pub fn extract_entrypoint(args: &[String]) -> Result<(PathBuf, Vec<String>)> {
    let name = args.get(1).context(
        "no command is given, secret-init can't determine the entrypoint (command), \
         please specify it explicitly",
    )?;

    let binary = look_path(name).with_context(|| format!("binary {name} not found"))?;
    let binary_args = args.get(2..).unwrap_or_default().to_vec();

    Ok((binary, binary_args))
}

/// Resolve a binary name the way execvp would: names containing a slash are
/// taken as paths, anything else is searched on PATH. No shell expansion.
fn look_path(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        if is_executable(&path) {
            return Ok(path);
        }
        anyhow::bail!("{name} is not an executable file");
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    anyhow::bail!("{name} not found on PATH")
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
