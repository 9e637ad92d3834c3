//! Free-text option parsing.
//!
//! A context can be configured from a single string such as
//! `"--d 256 --bx 32 --block_threads 2 --verbose"`. Every token that names a
//! known option is consumed together with its value; everything else is
//! handed back untouched so an application can parse its own options from
//! the leftovers.
//!
//! Option names are looked up in two tables. Per-dimension options are a
//! prefix naming the setting, optionally followed by a dimension name:
//! `d` alone sets every domain dimension, `dx` only `x`. Run options are
//! matched by their full name.

use crate::dims::Dims;
use crate::error::{Result, SolnError};
use crate::settings::{RunOptions, SizeSetting};

// Longer prefixes first so `nrx` is never read as `n` + `rx`.
const SIZE_OPTIONS: [(&str, SizeSetting); 6] = [
    ("mp", SizeSetting::MinPadSize),
    ("nr", SizeSetting::NumRanks),
    ("ri", SizeSetting::RankIndex),
    ("d", SizeSetting::RankDomainSize),
    ("r", SizeSetting::RegionSize),
    ("b", SizeSetting::BlockSize),
];

/// Integer-valued run options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOption {
    /// [`RunOptions::max_threads`].
    MaxThreads,
    /// [`RunOptions::thread_divisor`].
    ThreadDivisor,
    /// [`RunOptions::block_threads`].
    BlockThreads,
    /// [`RunOptions::step_alloc`].
    StepAlloc,
}

const COUNT_OPTIONS: [(&str, CountOption); 4] = [
    ("max_threads", CountOption::MaxThreads),
    ("thread_divisor", CountOption::ThreadDivisor),
    ("block_threads", CountOption::BlockThreads),
    ("step_alloc", CountOption::StepAlloc),
];

const OVERLAP_COMMS: &str = "overlap_comms";

impl CountOption {
    /// Stores `value` in the matching field.
    pub fn apply(self, run: &mut RunOptions, value: usize) {
        let field = match self {
            Self::MaxThreads => &mut run.max_threads,
            Self::ThreadDivisor => &mut run.thread_divisor,
            Self::BlockThreads => &mut run.block_threads,
            Self::StepAlloc => &mut run.step_alloc,
        };
        *field = value;
    }
}

/// One recognized option with its parsed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionAction {
    /// Set a per-dimension setting on each listed dimension.
    Size {
        /// The setting.
        setting: SizeSetting,
        /// Target dimensions.
        dims: Vec<String>,
        /// New value.
        value: i64,
    },
    /// Set an integer run option.
    Count(CountOption, usize),
    /// Enable or disable overlapping communication with computation.
    OverlapComms(bool),
}

/// Result of parsing an option string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOptions {
    /// Recognized options in the order they appeared.
    pub actions: Vec<OptionAction>,
    /// Tokens that were not consumed, verbatim and in order.
    pub leftover: Vec<String>,
}

impl ParsedOptions {
    /// The leftover tokens joined by single spaces.
    pub fn leftover_string(&self) -> String {
        self.leftover.join(" ")
    }
}

enum Kind {
    Size(SizeSetting, Vec<String>),
    Count(CountOption),
    Flag(bool),
}

fn lookup(name: &str, dims: &Dims) -> Option<Kind> {
    if name == OVERLAP_COMMS {
        return Some(Kind::Flag(true));
    }
    if name.strip_prefix("no-") == Some(OVERLAP_COMMS) {
        return Some(Kind::Flag(false));
    }
    if let Some((_, opt)) = COUNT_OPTIONS.iter().find(|(n, _)| *n == name) {
        return Some(Kind::Count(*opt));
    }
    for (prefix, setting) in SIZE_OPTIONS {
        let Some(suffix) = name.strip_prefix(prefix) else {
            continue;
        };
        if suffix.is_empty() {
            let all = dims.domain_dims().map(str::to_string).collect();
            return Some(Kind::Size(setting, all));
        }
        if dims
            .of_kinds(setting.allowed_kinds())
            .any(|dim| dim == suffix)
        {
            return Some(Kind::Size(setting, vec![suffix.to_string()]));
        }
    }
    None
}

fn option_name(token: &str) -> Option<&str> {
    token
        .strip_prefix("--")
        .or_else(|| token.strip_prefix('-'))
        .filter(|name| !name.is_empty())
}

/// Splits `args` on whitespace and extracts the recognized options.
///
/// # Errors
///
/// Returns [`SolnError::InvalidOption`] if a recognized option is missing
/// its value or the value is not an integer of the right sign.
///
/// # Examples
///
/// ```rust
/// use solnctx::dims::Dims;
/// use solnctx::options::parse;
///
/// let dims = Dims::new("t", ["x", "y"]);
/// let parsed = parse("--dx 64 -foo 3 --block_threads 2 bar", &dims)?;
/// assert_eq!(parsed.actions.len(), 2);
/// assert_eq!(parsed.leftover_string(), "-foo 3 bar");
/// # Ok::<(), solnctx::SolnError>(())
/// ```
pub fn parse(args: &str, dims: &Dims) -> Result<ParsedOptions> {
    let mut parsed = ParsedOptions::default();
    let mut tokens = args.split_whitespace();

    while let Some(token) = tokens.next() {
        let Some(name) = option_name(token) else {
            parsed.leftover.push(token.to_string());
            continue;
        };
        let Some(kind) = lookup(name, dims) else {
            parsed.leftover.push(token.to_string());
            continue;
        };

        let action = match kind {
            Kind::Flag(on) => OptionAction::OverlapComms(on),
            Kind::Size(setting, dims) => {
                let value = next_value::<i64>(name, tokens.next())?;
                OptionAction::Size {
                    setting,
                    dims,
                    value,
                }
            }
            Kind::Count(opt) => OptionAction::Count(opt, next_value::<usize>(name, tokens.next())?),
        };
        parsed.actions.push(action);
    }

    Ok(parsed)
}

fn next_value<T: std::str::FromStr>(name: &str, token: Option<&str>) -> Result<T> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| SolnError::InvalidOption {
            name: name.to_string(),
            value: token.map(str::to_string),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Dims {
        Dims::new("t", ["x", "y"])
    }

    #[test]
    fn test_prefix_without_dim_targets_domain_dims() {
        let parsed = parse("-d 100", &dims()).unwrap();
        assert_eq!(
            parsed.actions,
            vec![OptionAction::Size {
                setting: SizeSetting::RankDomainSize,
                dims: vec!["x".to_string(), "y".to_string()],
                value: 100,
            }]
        );
        assert!(parsed.leftover.is_empty());
    }

    #[test]
    fn test_dim_suffix_respects_kind() {
        let parsed = parse("--bt 2 --nrx 4 --nrt 4", &dims()).unwrap();
        assert_eq!(parsed.actions.len(), 2);
        assert!(matches!(
            &parsed.actions[0],
            OptionAction::Size { setting: SizeSetting::BlockSize, dims, value: 2 } if dims == &["t"]
        ));
        assert!(matches!(
            &parsed.actions[1],
            OptionAction::Size { setting: SizeSetting::NumRanks, dims, value: 4 } if dims == &["x"]
        ));
        // The step dimension cannot be split over ranks.
        assert_eq!(parsed.leftover, ["--nrt", "4"]);
    }

    #[test]
    fn test_run_options_and_flags() {
        let parsed = parse("-max_threads 8 -no-overlap_comms --overlap_comms", &dims()).unwrap();
        assert_eq!(
            parsed.actions,
            vec![
                OptionAction::Count(CountOption::MaxThreads, 8),
                OptionAction::OverlapComms(false),
                OptionAction::OverlapComms(true),
            ]
        );

        let mut run = RunOptions::default();
        CountOption::BlockThreads.apply(&mut run, 3);
        assert_eq!(run.block_threads, 3);
    }

    #[test]
    fn test_unknown_tokens_pass_through_verbatim() {
        let parsed = parse("  alpha  --zz 1 - -- -x  ", &dims()).unwrap();
        assert!(parsed.actions.is_empty());
        assert_eq!(parsed.leftover_string(), "alpha --zz 1 - -- -x");
    }

    #[test]
    fn test_bad_values() {
        assert!(matches!(
            parse("--dx", &dims()),
            Err(SolnError::InvalidOption { value: None, .. })
        ));
        assert!(match parse("--dx abc", &dims()) {
            Err(SolnError::InvalidOption { ref name, value: Some(ref v) }) if name == "dx" && v == "abc" => true,
            _ => false,
        });
        assert!(matches!(
            parse("--max_threads -1", &dims()),
            Err(SolnError::InvalidOption { .. })
        ));
    }
}
