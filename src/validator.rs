//! Validation of staged installer paths and caller-supplied arguments.
//!
//! This is the boundary between an attacker-controlled staged file and a
//! process executed with the agent's privileges, so every check fails closed.

use std::path::{Path, PathBuf};

/// Installer extensions the agent will execute, lowercase.
pub const ALLOWED_EXTENSIONS: [&str; 2] = ["exe", "msi"];

/// Longest argument string accepted from a caller.
const MAX_ARGUMENT_LEN: usize = 1024;

/// Characters that have no business in an installer argument string.
const FORBIDDEN_ARGUMENT_CHARS: &[char] = &['&', '|', ';', '<', '>', '`', '$', '%', '^'];

/// Why a path or argument string was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("installer path is empty")]
    EmptyPath,
    #[error("installer path could not be resolved")]
    Unresolvable,
    #[error("installer path is outside the staging directory")]
    OutsideStaging,
    #[error("installer path is not a regular file")]
    NotAFile,
    #[error("installer extension is not allowed")]
    ExtensionNotAllowed,
    #[error("arguments are too long ({0} bytes, max {MAX_ARGUMENT_LEN})")]
    ArgumentsTooLong(usize),
    #[error("arguments contain a forbidden character")]
    ForbiddenArgumentCharacter,
}

/// Installer flavour, derived from a validated extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerKind {
    /// A self-contained executable installer.
    Executable,
    /// A package consumed by the platform's package-installer front-end.
    Package,
}

impl InstallerKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "exe" => Some(Self::Executable),
            "msi" => Some(Self::Package),
            _ => None,
        }
    }
}

/// Validates installer paths against a single staging directory.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    /// Canonical staging directory, or `None` when it does not exist (in
    /// which case every path is rejected).
    staging: Option<PathBuf>,
}

impl CommandValidator {
    pub fn new(staging_dir: impl AsRef<Path>) -> Self {
        let staging = match std::fs::canonicalize(staging_dir.as_ref()) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(
                    dir = %staging_dir.as_ref().display(),
                    error = %e,
                    "staging directory unavailable, installer execution disabled"
                );
                None
            }
        };
        Self { staging }
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging.as_deref()
    }

    /// Validate a staged installer path, returning its canonical form.
    ///
    /// Rules are applied in order and the first failure wins: non-empty,
    /// strict descendant of the staging directory after canonicalization,
    /// existing regular file, allowed extension.
    pub fn validate(&self, path: &str) -> Result<PathBuf, Rejection> {
        if path.trim().is_empty() {
            return Err(Rejection::EmptyPath);
        }
        let staging = self.staging.as_deref().ok_or(Rejection::OutsideStaging)?;

        // canonicalize collapses `..` and resolves symlinks before the prefix
        // check; a path that cannot be resolved never reaches it.
        let canonical = std::fs::canonicalize(path).map_err(|_| Rejection::Unresolvable)?;
        if canonical == staging || !canonical.starts_with(staging) {
            return Err(Rejection::OutsideStaging);
        }

        let metadata = std::fs::metadata(&canonical).map_err(|_| Rejection::Unresolvable)?;
        if !metadata.is_file() {
            return Err(Rejection::NotAFile);
        }

        if InstallerKind::from_path(&canonical).is_none() {
            return Err(Rejection::ExtensionNotAllowed);
        }
        Ok(canonical)
    }

    /// Validate a caller-supplied argument string.
    pub fn validate_arguments(&self, args: &str) -> Result<(), Rejection> {
        validate_arguments(args)
    }
}

/// Reject argument strings that are oversized or carry control characters or
/// shell metacharacters. Installers are never run through a shell, but the
/// package front-end re-parses its command line.
pub fn validate_arguments(args: &str) -> Result<(), Rejection> {
    if args.len() > MAX_ARGUMENT_LEN {
        return Err(Rejection::ArgumentsTooLong(args.len()));
    }
    if args
        .chars()
        .any(|c| c.is_control() || FORBIDDEN_ARGUMENT_CHARS.contains(&c))
    {
        return Err(Rejection::ForbiddenArgumentCharacter);
    }
    Ok(())
}

/// Split a validated argument string into argv entries.
///
/// Double quotes group words containing spaces; quotes themselves are dropped.
pub fn split_arguments(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for c in args.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    out.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        out.push(current);
    }
    out
}
