use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

static BUILD_STRATA: OnceLock<Result<(), String>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub command_line: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    #[must_use]
    pub fn transcript(&self) -> String {
        format!(
            "$ {}\n[exit: {}]\n[stdout]\n{}[stderr]\n{}",
            self.command_line, self.exit_code, self.stdout, self.stderr
        )
    }
}

/// A scratch workspace: configuration documents, module scripts and a state
/// directory under one temporary root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    #[must_use]
    pub fn call_log(&self) -> PathBuf {
        self.root.join("calls.log")
    }

    /// Provider calls recorded by [`fake_module`] scripts, one `action node` per line.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.call_log())
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Forget recorded provider calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be removed.
    pub fn clear_calls(&self) -> std::io::Result<()> {
        match fs::remove_file(self.call_log()) {
            Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error),
            _ => Ok(()),
        }
    }

    /// Run one `strata` subcommand against this workspace.
    ///
    /// `NO_PAGER=1` is always set to keep output deterministic for assertions.
    ///
    /// # Errors
    ///
    /// Returns an error if building/running the `strata` binary fails.
    pub fn run(&self, command: &str, flags: &[&str]) -> Result<RunResult, String> {
        self.run_with_env(command, flags, &[])
    }

    /// Like [`Workspace::run`] with extra environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if building/running the `strata` binary fails.
    pub fn run_with_env(
        &self,
        command: &str,
        flags: &[&str],
        env_overrides: &[(&str, &str)],
    ) -> Result<RunResult, String> {
        let mut env = vec![(
            "STRATA_E2E_LOG".to_string(),
            self.call_log().display().to_string(),
        )];
        env.extend(
            env_overrides
                .iter()
                .map(|(name, value)| ((*name).to_string(), (*value).to_string())),
        );
        run_strata(command, &self.config_dir(), &self.state_dir(), flags, &env)
    }
}

/// Run `strata <command> <source>` as an external process.
///
/// # Errors
///
/// Returns an error if building/running the `strata` binary fails.
pub fn run_strata(
    command: &str,
    source: &Path,
    state_dir: &Path,
    flags: &[&str],
    env_overrides: &[(String, String)],
) -> Result<RunResult, String> {
    ensure_strata_built()?;
    let bin = strata_bin()?;

    let mut process = Command::new(bin);
    process.env("NO_PAGER", "1");
    process.env_remove("STRATA_LOG");
    process.arg(command);
    process.arg(source);
    process.arg("--state-dir");
    process.arg(state_dir);
    process.arg("--color");
    process.arg("never");
    process.args(flags);

    let mut command_parts = vec![
        "strata".to_string(),
        command.to_string(),
        source.display().to_string(),
    ];
    command_parts.extend(flags.iter().map(|flag| (*flag).to_string()));

    for (name, value) in env_overrides {
        process.env(name, value);
    }

    let output = process
        .output()
        .map_err(|error| format!("failed to run strata {command}: {error}"))?;

    Ok(RunResult {
        command_line: command_parts.join(" "),
        exit_code: output.status.code().unwrap_or(1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Write a text file, creating parent directories if needed.
///
/// # Errors
///
/// Returns an error if directories or file contents cannot be written.
pub fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

/// Shell module that provisions anything it is asked to and logs each call
/// to `$STRATA_E2E_LOG`. Nodes listed in `$STRATA_E2E_FAIL` (space separated)
/// fail their mutating calls.
#[must_use]
pub fn fake_module() -> &'static str {
    r#"#!/bin/sh
request=$(cat)
action=$(printf '%s' "$request" | sed -n 's/.*"action":"\([a-z]*\)".*/\1/p')
node=$(printf '%s' "$request" | sed -n 's/.*"node":"\([^"]*\)".*/\1/p')
if [ -n "$STRATA_E2E_LOG" ]; then
  echo "$action $node" >> "$STRATA_E2E_LOG"
fi
for failing in $STRATA_E2E_FAIL; do
  if [ "$failing" = "$node" ] && [ "$action" != "get" ] && [ "$action" != "list" ]; then
    printf '{"error":"%s rejected by module"}' "$node"
    exit 0
  fi
done
case "$action" in
  create) printf '{"id":"id-%s","outputs":{"id":"id-%s","host":"%s.internal"}}' "$node" "$node" "$node" ;;
  update) printf '{"outputs":{"id":"id-%s","host":"%s.internal"}}' "$node" "$node" ;;
  get) printf '{}' ;;
  list) printf '{"rows":[]}' ;;
  *) printf '{}' ;;
esac
"#
}

/// Write an executable script.
///
/// # Errors
///
/// Returns an error if the file cannot be written or made executable.
#[cfg(unix)]
pub fn write_script(path: &Path, content: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    write_file(path, content)?;
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)
}

fn ensure_strata_built() -> Result<(), String> {
    match BUILD_STRATA.get_or_init(|| {
        let status = Command::new("cargo")
            .arg("build")
            .arg("-q")
            .arg("-p")
            .arg("strata")
            .status()
            .map_err(|error| format!("failed to build strata binary: {error}"))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "failed to build strata binary: cargo exited with status {status}"
            ))
        }
    }) {
        Ok(()) => Ok(()),
        Err(error) => Err(error.clone()),
    }
}

fn strata_bin() -> Result<PathBuf, String> {
    let mut path = std::env::current_exe()
        .map_err(|error| format!("failed to determine current executable: {error}"))?;
    if !path.pop() {
        return Err("failed to resolve test executable directory".to_string());
    }
    if path.ends_with("deps") {
        let _ = path.pop();
    }
    Ok(path.join(format!("strata{}", std::env::consts::EXE_SUFFIX)))
}
