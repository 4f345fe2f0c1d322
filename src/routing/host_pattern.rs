//! Hostname pattern syntax — literal hostnames with `{regex}` placeholders
//!
//! `app.{[^.]+}.example.com` compiles to `^app\.[^.]+\.example\.com$`:
//! the literal parts have their dots escaped, the placeholder bodies are
//! spliced in verbatim, and the whole thing is anchored.

use crate::error::{EdgeError, Result};
use regex::Regex;

/// Compile a hostname pattern into an anchored regex
pub fn compile(pattern: &str) -> Result<Regex> {
    let placeholder = Regex::new(r"\{[^}]+\}").expect("static regex");

    // escape regex-relevant chars that legally appear in hostnames (".")
    let escaped = pattern.replace('.', r"\.");

    // splice the "{...}" sections back in as raw regex. the outer escaping
    // ruined any dots inside them, so undo it there.
    let spliced = placeholder.replace_all(&escaped, |caps: &regex::Captures<'_>| {
        let body = &caps[0][1..caps[0].len() - 1];
        body.replace(r"\.", ".")
    });

    let anchored = format!("^{}$", spliced);

    Regex::new(&anchored).map_err(|e| EdgeError::Validation(format!("hostname pattern: {}", e)))
}
