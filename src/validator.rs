//! Allow-list validation for restricted-shell input.
//!
//! This is the only path from user text to a subprocess. Input is split on
//! whitespace and checked against a per-program argument rule; the result is
//! a program name plus argument vector, never a shell string.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Rejection;

/// A command that passed the allow-list and can be executed directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub(crate) program: &'static str,
    pub(crate) args: Vec<String>,
}

impl ValidatedCommand {
    pub fn program(&self) -> &str {
        self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// How a program's arguments are checked.
#[derive(Debug, Clone, Copy)]
enum ArgRule {
    /// No arguments at all.
    NoArgs,
    /// Either no arguments or exactly this one.
    OptionalFlag(&'static str),
    /// Any number of arguments, each from this set.
    AnyOf(&'static [&'static str]),
    /// Exactly one plain filename that exists inside the sandbox.
    SandboxFile,
}

const POLICY: &[(&str, ArgRule)] = &[
    ("pwd", ArgRule::NoArgs),
    ("whoami", ArgRule::NoArgs),
    ("date", ArgRule::NoArgs),
    ("uname", ArgRule::OptionalFlag("-a")),
    ("ls", ArgRule::AnyOf(&["-l", "-a", "-la", "."])),
    ("cat", ArgRule::SandboxFile),
];

/// Names of the programs the restricted shell accepts.
pub fn allowed_programs() -> impl Iterator<Item = &'static str> {
    POLICY.iter().map(|(name, _)| *name)
}

fn filename_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex"))
}

/// Validate `raw` against the allow-list for the sandbox at `sandbox_dir`.
///
/// `max_len` is measured in characters after trimming.
pub fn validate(
    raw: &str,
    sandbox_dir: &Path,
    max_len: usize,
) -> Result<ValidatedCommand, Rejection> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(Rejection::Empty);
    }
    let len = input.chars().count();
    if len > max_len {
        return Err(Rejection::TooLong { max: max_len, actual: len });
    }

    let mut tokens = input.split_whitespace();
    let cmd = tokens.next().ok_or(Rejection::Empty)?;
    let args: Vec<&str> = tokens.collect();

    let &(program, rule) = POLICY
        .iter()
        .find(|(name, _)| *name == cmd)
        .ok_or_else(|| Rejection::not_allowed(format!("unknown command `{}`", cmd)))?;

    let args = check_args(program, rule, &args, sandbox_dir)?;
    Ok(ValidatedCommand { program, args })
}

fn check_args(
    program: &str,
    rule: ArgRule,
    args: &[&str],
    sandbox_dir: &Path,
) -> Result<Vec<String>, Rejection> {
    match rule {
        ArgRule::NoArgs if args.is_empty() => Ok(Vec::new()),
        ArgRule::NoArgs => Err(Rejection::not_allowed(format!("`{}` takes no arguments", program))),

        ArgRule::OptionalFlag(_) if args.is_empty() => Ok(Vec::new()),
        ArgRule::OptionalFlag(flag) if args == [flag] => Ok(vec![flag.to_string()]),
        ArgRule::OptionalFlag(flag) => Err(Rejection::not_allowed(format!(
            "`{}` accepts only `{}`",
            program, flag
        ))),

        ArgRule::AnyOf(allowed) => match args.iter().find(|a| !allowed.contains(*a)) {
            Some(bad) => Err(Rejection::not_allowed(format!(
                "`{}` does not accept `{}`",
                program, bad
            ))),
            None => Ok(args.iter().map(|a| a.to_string()).collect()),
        },

        ArgRule::SandboxFile => {
            let [name] = args else {
                return Err(Rejection::not_allowed(format!(
                    "`{}` takes exactly one filename",
                    program
                )));
            };
            check_sandbox_file(name, sandbox_dir)?;
            Ok(vec![name.to_string()])
        }
    }
}

fn check_sandbox_file(name: &str, sandbox_dir: &Path) -> Result<(), Rejection> {
    if !filename_pattern().is_match(name) || name == "." || name == ".." {
        return Err(Rejection::not_allowed(format!("invalid filename `{}`", name)));
    }

    // Resolve symlinks too; the target must still be inside the sandbox.
    let root = sandbox_dir
        .canonicalize()
        .map_err(|_| Rejection::not_allowed("sandbox unavailable"))?;
    let resolved = root
        .join(name)
        .canonicalize()
        .map_err(|_| Rejection::not_allowed(format!("no such file `{}`", name)))?;
    if !resolved.starts_with(&root) || resolved == root {
        return Err(Rejection::not_allowed(format!("invalid filename `{}`", name)));
    }
    Ok(())
}
