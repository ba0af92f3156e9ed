// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shell-word splitting and per-transport quoting.
//!
//! [`split`] turns a command line into words the way a POSIX shell would for
//! plain words and quotes (no expansion). The quoting helpers go the other
//! way, producing a single word each remote shell reads back verbatim:
//!
//! | Transport | Quoting |
//! |-----------|---------|
//! | SSH | [`quote_posix`]: `'...'`, with `'` written as `'\''` |
//! | WinRM | [`quote_powershell`]: `'...'`, with `'` doubled |
//! | gRPC | none, the argument vector travels as is |

use crate::error::{Error, Result};

/// Split a command line into words.
///
/// Single quotes keep everything literal, double quotes allow `\"`, `\\`,
/// `` \` `` and `\$` escapes, and a backslash outside quotes escapes the next
/// character. Unterminated quotes are an error.
pub fn split(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(Error::Parse(format!("unterminated quote in {}", input))),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '`' | '$')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => {
                                return Err(Error::Parse(format!(
                                    "unterminated quote in {}",
                                    input
                                )));
                            }
                        },
                        Some(c) => word.push(c),
                        None => return Err(Error::Parse(format!("unterminated quote in {}", input))),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => word.push(c),
                    None => return Err(Error::Parse(format!("trailing backslash in {}", input))),
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    if in_word {
        words.push(word);
    }
    Ok(words)
}

fn is_plain(word: &str) -> bool {
    !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | ',' | '+' | '@' | '%')
        })
}

/// Quote one word for a POSIX shell.
pub fn quote_posix(word: &str) -> String {
    if is_plain(word) {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Quote one word for PowerShell.
pub fn quote_powershell(word: &str) -> String {
    if is_plain(word) && !word.contains('@') {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "''"))
}

/// Join words into a POSIX command line.
pub fn join_posix<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| quote_posix(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
