//! Bracket-balance guard for batch edits.
//!
//! Before an edit descriptor with `preserveBrackets` becomes a wire edit,
//! the whole file is scanned for balanced bracket pairs. A pair with
//! exactly one endpoint inside the descriptor's line range rejects the
//! batch; pairs fully inside or fully outside are fine. Mismatched and
//! unclosed brackets are ignored.

use std::collections::HashMap;
use std::fmt;

use crate::edit::TextEditOp;

/// Which side of the pair the edit range cuts through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketViolation {
    /// The range contains the opener but not the closer.
    CrossingPairStart,
    /// The range contains the closer but not the opener.
    CrossingPairEnd,
}

impl fmt::Display for BracketViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrossingPairStart => f.write_str("CrossingPairStart"),
            Self::CrossingPairEnd => f.write_str("CrossingPairEnd"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("bracket balance violation ({violation}): {message}")]
pub struct BracketGuardError {
    pub violation: BracketViolation,
    pub message: String,
}

const DEFAULT_PAIRS: [(char, char); 3] = [('(', ')'), ('[', ']'), ('{', '}')];

fn pair_set(edit: &TextEditOp) -> HashMap<char, char> {
    if edit.bracket_types.is_empty() {
        return DEFAULT_PAIRS.into_iter().collect();
    }
    let mut pairs = HashMap::new();
    for spec in &edit.bracket_types {
        let mut chars = spec.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(open), Some(close), None) => {
                pairs.insert(open, close);
            }
            _ => {
                tracing::warn!("ignoring malformed bracket pair spec {spec:?}");
            }
        }
    }
    pairs
}

/// Check whether `edit`'s line range cuts through any balanced bracket
/// pair in `content`.
pub(crate) fn check_bracket_balance(
    content: &str,
    edit: &TextEditOp,
) -> Result<(), BracketGuardError> {
    let pairs = pair_set(edit);
    if pairs.is_empty() {
        return Ok(());
    }
    let closers: HashMap<char, char> = pairs.iter().map(|(&o, &c)| (c, o)).collect();

    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = content.split(eol).collect();

    let range_start = (edit.start_line.saturating_sub(1)) as usize;
    let range_end = ((edit.end_line.saturating_sub(1)) as usize).min(lines.len().saturating_sub(1));
    if range_start > range_end {
        // Degenerate range; not a balance problem.
        return Ok(());
    }
    let in_range = |line: usize| line >= range_start && line <= range_end;

    // (bracket char, 0-based line) for each still-open bracket.
    let mut stack: Vec<(char, usize)> = Vec::new();

    for (line_idx, line) in lines.iter().enumerate() {
        for ch in line.chars() {
            if pairs.contains_key(&ch) {
                stack.push((ch, line_idx));
                continue;
            }
            let Some(&expected_open) = closers.get(&ch) else {
                continue;
            };
            let Some(&(open_ch, open_line)) = stack.last() else {
                // Stray closer, ignored.
                continue;
            };
            if open_ch != expected_open {
                // Mismatched pair, ignored.
                continue;
            }
            stack.pop();

            let open_inside = in_range(open_line);
            let close_inside = in_range(line_idx);
            if open_inside == close_inside {
                continue;
            }

            if open_inside {
                return Err(BracketGuardError {
                    violation: BracketViolation::CrossingPairStart,
                    message: format!(
                        "Edit range includes opening bracket '{open_ch}' at line {} but not its closing bracket at line {}",
                        open_line + 1,
                        line_idx + 1
                    ),
                });
            }
            return Err(BracketGuardError {
                violation: BracketViolation::CrossingPairEnd,
                message: format!(
                    "Edit range includes closing bracket '{ch}' at line {} but not its opening bracket at line {}",
                    line_idx + 1,
                    open_line + 1
                ),
            });
        }
    }

    // Whatever is left on the stack is unclosed and ignored.
    Ok(())
}
