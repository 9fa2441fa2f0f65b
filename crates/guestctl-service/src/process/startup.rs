//! Turns a host start request into an executable, an argument vector and
//! environment changes.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use guestctl_proto::msg::{host_features, proc_flags, MAX_ARGS_LEN, MAX_ENV_LEN};
use guestctl_proto::{ErrorCode, ProcStartupInfo, Result};

/// Command names that run the agent binary itself.
const SELF_ALIASES: &[&str] = &["guestctl-agent", "guestctl"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandLine {
    pub exe: PathBuf,
    pub argv0: OsString,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EnvChange {
    Set(OsString, OsString),
    Remove(OsString),
}

pub(crate) fn command_line(
    info: &ProcStartupInfo,
    host_features: u64,
    agent_exe: &Path,
) -> Result<CommandLine> {
    if info.cmd.is_empty() {
        return Err(ErrorCode::InvalidParameter);
    }
    if info.flags & !proc_flags::VALID_MASK != 0 {
        return Err(ErrorCode::InvalidParameter);
    }
    if info.flags & proc_flags::EXPAND_ARGUMENTS != 0 {
        return Err(ErrorCode::NotSupported);
    }
    if info.args.len() > MAX_ARGS_LEN {
        return Err(ErrorCode::InvalidParameter);
    }

    let mut args = if info.flags & proc_flags::UNQUOTED_ARGS != 0 {
        info.args.split_ascii_whitespace().map(str::to_string).collect()
    } else {
        split_shell_args(&info.args)?
    };

    // Newer hosts send argv[0] as the first argument.
    let argv0 = if host_features & host_features::PROCESS_ARGV0 != 0 && !args.is_empty() {
        args.remove(0)
    } else {
        info.cmd.clone()
    };

    let exe = if SELF_ALIASES.contains(&info.cmd.as_str()) {
        agent_exe.to_path_buf()
    } else {
        PathBuf::from(&info.cmd)
    };

    Ok(CommandLine {
        exe,
        argv0: OsString::from(argv0),
        args,
    })
}

/// Splits `s` the way a Bourne shell splits words, without expansion.
pub(crate) fn split_shell_args(s: &str) -> Result<Vec<String>> {
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut out = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => match c {
                '\'' => quote = Quote::None,
                _ => word.push(c),
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(n @ ('$' | '`' | '"' | '\\')) => word.push(n),
                    Some('\n') => {}
                    Some(n) => {
                        word.push('\\');
                        word.push(n);
                    }
                    None => return Err(ErrorCode::InvalidParameter),
                },
                _ => word.push(c),
            },
            Quote::None => match c {
                ' ' | '\t' | '\n' | '\r' => {
                    if in_word {
                        out.push(std::mem::take(&mut word));
                        in_word = false;
                    }
                }
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some('\n') => {}
                    Some(n) => {
                        word.push(n);
                        in_word = true;
                    }
                    None => return Err(ErrorCode::InvalidParameter),
                },
                _ => {
                    word.push(c);
                    in_word = true;
                }
            },
        }
    }

    if !matches!(quote, Quote::None) {
        return Err(ErrorCode::InvalidParameter);
    }
    if in_word {
        out.push(word);
    }
    Ok(out)
}

/// Parses a NUL separated block of `KEY=VALUE` (set) and `KEY` (unset)
/// entries.
pub(crate) fn env_changes(block: &[u8]) -> Result<Vec<EnvChange>> {
    if block.len() > MAX_ENV_LEN {
        return Err(ErrorCode::InvalidParameter);
    }
    let mut changes = Vec::new();
    for entry in block.split(|b| *b == 0).filter(|e| !e.is_empty()) {
        match entry.iter().position(|b| *b == b'=') {
            Some(0) => return Err(ErrorCode::InvalidParameter),
            Some(eq) => changes.push(EnvChange::Set(
                OsString::from_vec(entry[..eq].to_vec()),
                OsString::from_vec(entry[eq + 1..].to_vec()),
            )),
            None => changes.push(EnvChange::Remove(OsString::from_vec(entry.to_vec()))),
        }
    }
    Ok(changes)
}
