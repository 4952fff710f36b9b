use nxup_semver::RangeSet;
use semver::Version;

/// Fill missing components with zero, then try the candidate, the candidate
/// without its patch, and the candidate without patch and minor against
/// `> 0.0.0`. The first variant that parses and clears the bar wins; inputs
/// nothing salvages come back as `0.0.0` instead of an error.
pub fn normalize_version(version: &str) -> String {
    let (core, prerelease) = match version.split_once('-') {
        Some((core, prerelease)) => (core, Some(prerelease)),
        None => (version, None),
    };

    let mut parts = core.split('.');
    let major = non_empty(parts.next()).unwrap_or("0");
    let minor = non_empty(parts.next()).unwrap_or("0");
    let patch = non_empty(parts.next()).unwrap_or("0");

    let full = match prerelease {
        Some(tag) => format!("{major}.{minor}.{patch}-{tag}"),
        None => format!("{major}.{minor}.{patch}"),
    };
    let without_patch = format!("{major}.{minor}.0");
    let without_patch_and_minor = format!("{major}.0.0");

    for candidate in [full, without_patch, without_patch_and_minor] {
        if let Ok(parsed) = Version::parse(&candidate) {
            if parsed > Version::new(0, 0, 0) {
                return candidate;
            }
        }
    }

    "0.0.0".to_string()
}

/// `latest` and `next` are registry dist-tags, not versions; they pass
/// through untouched so the fetcher can resolve them.
pub fn normalize_version_with_tag_check(version: &str) -> String {
    if version == "latest" || version == "next" {
        return version.to_string();
    }
    normalize_version(version)
}

pub fn is_version_tag(version: &str) -> bool {
    version == "latest" || version == "next"
}

/// npm's clean-then-coerce: strip decoration and reparse, and if that fails
/// pull the first dotted number run out of the string.
pub fn clean_semver(version: &str) -> String {
    let trimmed = version
        .trim()
        .trim_start_matches('=')
        .trim_start_matches('v');
    if let Ok(parsed) = Version::parse(trimmed) {
        return parsed.to_string();
    }
    coerce(version).unwrap_or_else(|| "0.0.0".to_string())
}

fn coerce(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let start = bytes.iter().position(|b| b.is_ascii_digit())?;

    let mut components = Vec::new();
    let mut current = String::new();

    for &b in &bytes[start..] {
        if b.is_ascii_digit() {
            current.push(b as char);
        } else if b == b'.' && !current.is_empty() && components.len() < 2 {
            components.push(current.clone());
            current.clear();
        } else {
            break;
        }
    }
    if !current.is_empty() {
        components.push(current);
    }

    let major = components.first().map(String::as_str).unwrap_or("0");
    let minor = components.get(1).map(String::as_str).unwrap_or("0");
    let patch = components.get(2).map(String::as_str).unwrap_or("0");
    Some(format!("{major}.{minor}.{patch}"))
}

fn non_empty(part: Option<&str>) -> Option<&str> {
    part.filter(|p| !p.is_empty())
}

fn parse_normalized(version: &str) -> Version {
    match Version::parse(&normalize_version(version)) {
        Ok(parsed) => parsed,
        // normalize_version only returns strings it parsed itself
        Err(_) => Version::new(0, 0, 0),
    }
}

pub fn gt(a: &str, b: &str) -> bool {
    parse_normalized(a) > parse_normalized(b)
}

pub fn gte(a: &str, b: &str) -> bool {
    parse_normalized(a) >= parse_normalized(b)
}

pub fn lt(a: &str, b: &str) -> bool {
    parse_normalized(a) < parse_normalized(b)
}

pub fn lte(a: &str, b: &str) -> bool {
    parse_normalized(a) <= parse_normalized(b)
}

/// Prerelease-inclusive range check, the way migration `requires` predicates
/// are evaluated. Unparseable ranges never match.
pub fn satisfies(version: &str, range: &str) -> bool {
    let Ok(range) = RangeSet::parse(range) else {
        return false;
    };
    range.matches_with_prereleases(&parse_normalized(version))
}
