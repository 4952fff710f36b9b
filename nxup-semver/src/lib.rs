use semver::{Comparator, Op, Prerelease, Version, VersionReq};
use std::error::Error as StdError;
use std::fmt;

#[derive(Debug, Clone)]
pub struct RangeSet {
    original: String,
    ranges: Vec<VersionReq>,
}

#[derive(Debug, Clone)]
pub struct Error {
    input: String,
    message: String,
}

impl Error {
    pub fn new(input: String, message: String) -> Self {
        Self { input, message }
    }

    pub fn input(&self) -> &str {
        &self.input
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.input)
    }
}

impl StdError for Error {}

impl RangeSet {
    pub fn parse(original: &str) -> Result<Self, Error> {
        let mut s = original.trim();

        if s.is_empty() {
            s = "*";
        }

        let mut ranges = Vec::new();

        for part in s.split("||") {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let normalized = normalize_and_part(part);

            let req = VersionReq::parse(&normalized)
                .map_err(|err| Error::new(original.to_string(), err.to_string()))?;

            ranges.push(req);
        }

        if ranges.is_empty() {
            let req = VersionReq::parse("*")
                .map_err(|err| Error::new(original.to_string(), err.to_string()))?;
            ranges.push(req);
        }

        Ok(RangeSet {
            original: original.to_string(),
            ranges,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.ranges.iter().any(|r| r.matches(version))
    }

    /// npm's `includePrerelease` semantics: prerelease versions are compared
    /// purely by precedence instead of being rejected unless a comparator
    /// names the same release triple.
    pub fn matches_with_prereleases(&self, version: &Version) -> bool {
        self.ranges
            .iter()
            .any(|req| req.comparators.iter().all(|c| comparator_holds(c, version)))
    }

    pub fn original(&self) -> &str {
        &self.original
    }
}

fn normalize_and_part(part: &str) -> String {
    let tokens: Vec<&str> = part.split_whitespace().collect();

    if tokens.len() <= 1 {
        return part.to_string();
    }

    if tokens.len() == 3 && tokens[1] == "-" {
        return part.to_string();
    }

    let mut result = String::new();

    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            let prev = tokens[i - 1];
            if matches!(prev, "=" | ">" | ">=" | "<" | "<=" | "~" | "^") {
                result.push(' ');
            } else {
                result.push_str(", ");
            }
        }

        result.push_str(token);
    }
    result
}

// Bound endpoint: the version plus whether the endpoint itself is included.
type Bound = (Version, bool);

fn comparator_holds(c: &Comparator, v: &Version) -> bool {
    let (lower, upper) = comparator_bounds(c);

    if let Some((bound, inclusive)) = lower {
        let ok = if inclusive { *v >= bound } else { *v > bound };
        if !ok {
            return false;
        }
    }

    if let Some((bound, inclusive)) = upper {
        let ok = if inclusive { *v <= bound } else { *v < bound };
        if !ok {
            return false;
        }
    }

    true
}

fn comparator_bounds(c: &Comparator) -> (Option<Bound>, Option<Bound>) {
    let filled = Version {
        major: c.major,
        minor: c.minor.unwrap_or(0),
        patch: c.patch.unwrap_or(0),
        pre: c.pre.clone(),
        build: Default::default(),
    };

    match c.op {
        Op::Exact | Op::Wildcard => {
            if c.minor.is_none() {
                (
                    Some((release(c.major, 0, 0), true)),
                    Some((floor(c.major + 1, 0, 0), false)),
                )
            } else if c.patch.is_none() {
                let minor = c.minor.unwrap_or(0);
                (
                    Some((release(c.major, minor, 0), true)),
                    Some((floor(c.major, minor + 1, 0), false)),
                )
            } else {
                (Some((filled.clone(), true)), Some((filled, true)))
            }
        }
        Op::Greater => {
            // A partial like >1.2 means "past every 1.2.x", i.e. >=1.3.0.
            if c.minor.is_none() {
                (Some((release(c.major + 1, 0, 0), true)), None)
            } else if c.patch.is_none() {
                (
                    Some((release(c.major, c.minor.unwrap_or(0) + 1, 0), true)),
                    None,
                )
            } else {
                (Some((filled, false)), None)
            }
        }
        Op::GreaterEq => (Some((filled, true)), None),
        Op::Less => {
            if c.patch.is_none() {
                (None, Some((floor(c.major, c.minor.unwrap_or(0), 0), false)))
            } else {
                (None, Some((filled, false)))
            }
        }
        Op::LessEq => {
            if c.minor.is_none() {
                (None, Some((floor(c.major + 1, 0, 0), false)))
            } else if c.patch.is_none() {
                (None, Some((floor(c.major, c.minor.unwrap_or(0) + 1, 0), false)))
            } else {
                (None, Some((filled, true)))
            }
        }
        Op::Tilde => {
            let upper = if c.minor.is_some() {
                floor(c.major, c.minor.unwrap_or(0) + 1, 0)
            } else {
                floor(c.major + 1, 0, 0)
            };
            (Some((filled, true)), Some((upper, false)))
        }
        Op::Caret => {
            let upper = if c.major > 0 {
                floor(c.major + 1, 0, 0)
            } else if c.minor.is_none() {
                floor(1, 0, 0)
            } else if c.minor.unwrap_or(0) > 0 {
                floor(0, c.minor.unwrap_or(0) + 1, 0)
            } else if c.patch.is_none() {
                floor(0, 1, 0)
            } else {
                floor(0, 0, c.patch.unwrap_or(0) + 1)
            };
            (Some((filled, true)), Some((upper, false)))
        }
        _ => (Some((filled.clone(), true)), Some((filled, true))),
    }
}

fn release(major: u64, minor: u64, patch: u64) -> Version {
    Version::new(major, minor, patch)
}

// Exclusive upper bounds sit at the `-0` prerelease floor of the next
// release so prereleases of the bound itself stay out of range.
fn floor(major: u64, minor: u64, patch: u64) -> Version {
    Version {
        major,
        minor,
        patch,
        pre: Prerelease::new("0").unwrap(),
        build: Default::default(),
    }
}

pub use semver::Version as SemverVersion;
