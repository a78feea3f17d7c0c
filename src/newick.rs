//! Minimal Newick handling: seed-tree normalization and leaf lookup.
//!
//! Only what the orchestrator needs. Tree inference and rerooting are the
//! external tools' job.

use crate::error::Result;
use std::path::Path;

/// Strip bracketed comments (`[&...]` annotations) and whitespace outside
/// quoted labels, and make sure the tree ends with a single `;`.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_quote = false;
    let mut comment_depth = 0usize;

    for c in text.chars() {
        if in_quote {
            out.push(c);
            if c == '\'' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '[' => comment_depth += 1,
            ']' if comment_depth > 0 => comment_depth -= 1,
            _ if comment_depth > 0 => {}
            '\'' => {
                in_quote = true;
                out.push(c);
            }
            c if c.is_whitespace() => {}
            c => out.push(c),
        }
    }

    let trimmed = out.trim_end_matches(';');
    format!("{};", trimmed)
}

/// Leaf labels in the order they appear.
pub fn leaf_names(text: &str) -> Vec<String> {
    let clean = normalize(text);
    let mut leaves = Vec::new();
    let mut token = String::new();
    let mut expect_leaf = true;
    let mut in_length = false;
    let mut in_quote = false;

    for c in clean.chars() {
        if in_quote {
            if c == '\'' {
                in_quote = false;
            } else {
                token.push(c);
            }
            continue;
        }
        match c {
            '(' | ',' | ')' | ';' => {
                if expect_leaf && !token.is_empty() {
                    leaves.push(std::mem::take(&mut token));
                }
                token.clear();
                in_length = false;
                expect_leaf = c != ')';
            }
            ':' => in_length = true,
            '\'' if !in_length => in_quote = true,
            _ if in_length => {}
            c => token.push(c),
        }
    }
    leaves
}

/// Read a tree file and return its leaf labels.
pub fn read_leaf_names(path: &Path) -> Result<Vec<String>> {
    Ok(leaf_names(&std::fs::read_to_string(path)?))
}
