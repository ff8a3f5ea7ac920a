//! Semantic version comparison and dependency constraints.
//!
//! Comparison is lenient about formatting: a leading `v`, leading zeros,
//! missing minor/patch components and build metadata never change the
//! outcome. Every input string maps to a [`Version`] key, so [`compare`]
//! is total and transitive.

use std::cmp::Ordering;
use std::fmt;

use crate::error::PluginError;

/// Compare two version strings using semantic-version precedence.
pub fn compare(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

/// A single pre-release identifier.
///
/// Variant order matters: numeric identifiers sort before alphanumeric ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Identifier {
    Numeric(u64),
    Alpha(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(n) => write!(f, "{n}"),
            Identifier::Alpha(s) => f.write_str(s),
        }
    }
}

/// Normalized version key.
#[derive(Debug, Clone)]
pub struct Version {
    core: Vec<u64>,
    pre: Vec<Identifier>,
}

/// Leading ASCII digits of `segment` as a number, plus the remaining text.
fn split_numeric(segment: &str) -> (u64, &str) {
    let end = segment
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(segment.len());
    let (digits, rest) = segment.split_at(end);
    let value = if digits.is_empty() {
        0
    } else {
        digits.parse().unwrap_or(u64::MAX)
    };
    (value, rest)
}

impl Version {
    /// Parse any string into a version key. Never fails.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let without_build = trimmed.split('+').next().unwrap_or_default();

        let (core_str, pre_str) = match without_build.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (without_build, None),
        };

        let mut core = Vec::with_capacity(3);
        let mut stray = String::new();
        for segment in core_str.split('.') {
            let (value, rest) = split_numeric(segment);
            core.push(value);
            if !rest.is_empty() && stray.is_empty() {
                // "2.0.0rc1" carries its pre-release without a dash
                stray = rest.to_string();
            }
        }
        while core.len() > 3 && core.last() == Some(&0) {
            core.pop();
        }

        let pre_source = match pre_str {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => stray,
        };
        let pre = pre_source
            .split('.')
            .filter(|id| !id.is_empty())
            .map(|id| {
                if id.bytes().all(|b| b.is_ascii_digit()) {
                    Identifier::Numeric(id.parse().unwrap_or(u64::MAX))
                } else {
                    Identifier::Alpha(id.to_string())
                }
            })
            .collect();

        Self { core, pre }
    }

    fn component(&self, index: usize) -> u64 {
        self.core.get(index).copied().unwrap_or(0)
    }

    pub fn major(&self) -> u64 {
        self.component(0)
    }

    pub fn minor(&self) -> u64 {
        self.component(1)
    }

    pub fn patch(&self) -> u64 {
        self.component(2)
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    fn release(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            core: vec![major, minor, patch],
            pre: Vec::new(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())?;
        for extra in self.core.iter().skip(3) {
            write!(f, ".{extra}")?;
        }
        if !self.pre.is_empty() {
            let pre: Vec<String> = self.pre.iter().map(ToString::to_string).collect();
            write!(f, "-{}", pre.join("."))?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.core.len().max(other.core.len());
        for i in 0..len {
            match self.component(i).cmp(&other.component(i)) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        match (self.pre.is_empty(), other.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            // Lexicographic over identifiers, shorter prefix first
            (false, false) => self.pre.cmp(&other.pre),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

// ─── Constraints ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Exact,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    Caret,
    Tilde,
}

#[derive(Debug, Clone)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn matches(&self, candidate: &Version) -> bool {
        let v = &self.version;
        match self.op {
            Op::Exact => candidate == v,
            Op::Greater => candidate > v,
            Op::GreaterEq => candidate >= v,
            Op::Less => candidate < v,
            Op::LessEq => candidate <= v,
            Op::Caret => {
                let upper = if v.major() > 0 {
                    v.major().checked_add(1).map(|m| Version::release(m, 0, 0))
                } else if v.minor() > 0 {
                    v.minor().checked_add(1).map(|m| Version::release(0, m, 0))
                } else {
                    v.patch().checked_add(1).map(|p| Version::release(0, 0, p))
                };
                candidate >= v && upper.is_none_or(|upper| *candidate < upper)
            }
            Op::Tilde => {
                // A saturated component has no next release: unbounded above.
                let upper = v
                    .minor()
                    .checked_add(1)
                    .map(|m| Version::release(v.major(), m, 0));
                candidate >= v && upper.is_none_or(|upper| *candidate < upper)
            }
        }
    }
}

/// A version requirement such as `>=1.0.0`, `^1.2`, `~1.4, <1.4.9` or `*`.
///
/// A bare version (`1.0.0`) means "at least this version".
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    raw: String,
    comparators: Vec<Comparator>,
}

impl VersionConstraint {
    pub fn parse(input: &str) -> Result<Self, PluginError> {
        let raw = input.trim().to_string();
        let mut comparators = Vec::new();

        for part in raw.split(',').map(str::trim) {
            if part.is_empty() || part == "*" || part.eq_ignore_ascii_case("x") {
                continue;
            }

            let op_len = part
                .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
                .unwrap_or(part.len());
            let (op_str, version_str) = part.split_at(op_len);
            let version_str = version_str.trim();

            let op = match op_str {
                "" | ">=" => Op::GreaterEq,
                "=" | "==" => Op::Exact,
                ">" => Op::Greater,
                "<" => Op::Less,
                "<=" => Op::LessEq,
                "^" => Op::Caret,
                "~" | "~>" => Op::Tilde,
                other => {
                    return Err(PluginError::Incompatible(format!(
                        "unsupported operator '{other}' in constraint '{raw}'"
                    )))
                }
            };

            if !version_str.trim_start_matches(['v', 'V']).starts_with(|c: char| c.is_ascii_digit()) {
                return Err(PluginError::Incompatible(format!(
                    "constraint '{raw}' has no version after '{op_str}'"
                )));
            }

            comparators.push(Comparator {
                op,
                version: Version::parse(version_str),
            });
        }

        Ok(Self { raw, comparators })
    }

    /// Whether `version` satisfies every comparator of this constraint.
    pub fn matches(&self, version: &str) -> bool {
        let candidate = Version::parse(version);
        self.comparators.iter().all(|c| c.matches(&candidate))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&self.raw)
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
