use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::endpoint::escape::unescape;
use crate::endpoint::Endpoint;
use crate::error::FabricError;

/// An abstract endpoint is parsed only — it never survives into a route
/// table or envelope. `abstract://seg1/seg2` is resolved through the
/// process-wide [`AbstractMap`] into a physical or logical endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractEndpoint {
    pub segments: Vec<String>,
}

pub fn parse(body: &str) -> Result<AbstractEndpoint, FabricError> {
    if body.is_empty() {
        return Err(FabricError::malformed("empty abstract endpoint"));
    }
    let mut segments = Vec::new();
    for raw in body.split('/') {
        if raw.is_empty() {
            return Err(FabricError::malformed("empty segment in abstract endpoint"));
        }
        segments.push(unescape(raw).map_err(FabricError::malformed)?);
    }
    Ok(AbstractEndpoint { segments })
}

#[derive(Debug, Clone)]
struct Entry {
    pattern: Vec<String>,
    target: String,
}

/// Process-wide `pattern → target` store with `$(name)` variable expansion.
///
/// A pattern segment of `*` matches any single segment without capturing; a
/// pattern segment of `$(name)` matches any single segment and binds it to
/// `name`, which the target template may reference as `$(name)`.
#[derive(Debug, Default)]
pub struct AbstractMap {
    entries: RwLock<Vec<Entry>>,
}

static GLOBAL: Lazy<AbstractMap> = Lazy::new(AbstractMap::default);

impl AbstractMap {
    /// The process-wide instance. Reconfiguration is an explicit `reload`
    /// call, never a live-patch of individual entries mid-flight.
    pub fn global() -> &'static AbstractMap {
        &GLOBAL
    }

    pub fn reload(&self, entries: impl IntoIterator<Item = (String, String)>) {
        let mut guard = self.entries.write();
        guard.clear();
        for (pattern, target) in entries {
            let pattern = pattern.split('/').map(|s| s.to_string()).collect();
            guard.push(Entry { pattern, target });
        }
    }

    pub fn resolve(&self, abstract_ep: &AbstractEndpoint) -> Result<Endpoint, FabricError> {
        let guard = self.entries.read();
        for entry in guard.iter() {
            if let Some(vars) = match_pattern(&entry.pattern, &abstract_ep.segments) {
                let expanded = expand(&entry.target, &vars);
                drop(guard);
                return Endpoint::parse_no_abstract(&expanded);
            }
        }
        Err(FabricError::NotFound(format!(
            "no abstract-map entry for abstract://{}",
            abstract_ep.segments.join("/")
        )))
    }
}

fn match_pattern(pattern: &[String], segments: &[String]) -> Option<HashMap<String, String>> {
    if pattern.len() != segments.len() {
        return None;
    }
    let mut vars = HashMap::new();
    for (p, s) in pattern.iter().zip(segments.iter()) {
        if p == "*" {
            continue;
        }
        if let Some(name) = p.strip_prefix("$(").and_then(|r| r.strip_suffix(')')) {
            vars.insert(name.to_string(), s.clone());
            continue;
        }
        if !p.eq_ignore_ascii_case(s) {
            return None;
        }
    }
    Some(vars)
}

fn expand(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(end) = after.find(')') {
            let name = &after[..end];
            if let Some(val) = vars.get(name) {
                out.push_str(val);
            } else {
                out.push_str("$(");
                out.push_str(name);
                out.push(')');
            }
            rest = &after[end + 1..];
        } else {
            out.push_str("$(");
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_with_variable_expansion() {
        let map = AbstractMap::default();
        map.reload(vec![(
            "svc/$(name)".to_string(),
            "logical://services/$(name)".to_string(),
        )]);
        let ep = parse("svc/billing").unwrap();
        let resolved = map.resolve(&ep).unwrap();
        assert_eq!(resolved.to_string(), "logical://services/billing");
    }

    #[test]
    fn wildcard_segment_does_not_capture() {
        let map = AbstractMap::default();
        map.reload(vec![("svc/*".to_string(), "logical://fallback".to_string())]);
        let ep = parse("svc/anything").unwrap();
        assert_eq!(map.resolve(&ep).unwrap().to_string(), "logical://fallback");
    }

    #[test]
    fn missing_entry_errors() {
        let map = AbstractMap::default();
        let ep = parse("nowhere").unwrap();
        assert!(map.resolve(&ep).is_err());
    }
}
