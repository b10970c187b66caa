//! Parsers for the structured lines of `unit.log` the harness cares about.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;

/// Modules (and their versions) the server reported while loading, plus
/// features detected from `unitd --version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AvailableModules(pub BTreeMap<String, Vec<String>>);

impl AvailableModules {
    /// Collects `module: <name> <version> "<path>"` lines.
    pub fn from_log(text: &str) -> Self {
        let mut modules = Self::default();
        let re = Regex::new(r#"(?m)module: ([a-zA-Z]+) (.*) ".*"$"#).expect("static regex");
        for caps in re.captures_iter(text) {
            modules.insert(&caps[1], &caps[2]);
        }
        modules
    }

    /// Adds build features advertised by the `--version` output
    /// (`configure arguments: ... --openssl --njs`).
    pub fn detect_features(&mut self, version_output: &str) {
        for (flag, module) in [("--openssl", "openssl"), ("--njs", "njs")] {
            if version_output.split_whitespace().any(|tok| tok == flag) {
                self.insert(module, "any");
            }
        }
    }

    pub fn insert(&mut self, module: &str, version: &str) {
        let versions = self.0.entry(module.to_owned()).or_default();
        if !versions.iter().any(|v| v == version) {
            versions.push(version.to_owned());
        }
    }

    pub fn has(&self, module: &str) -> bool {
        self.0.contains_key(module)
    }

    pub fn versions(&self, module: &str) -> &[String] {
        self.0.get(module).map(Vec::as_slice).unwrap_or_default()
    }

    /// Requirements from `required` that are not available.
    pub fn missing<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required.iter().copied().filter(|m| !self.has(m)).collect()
    }
}

impl std::fmt::Display for AvailableModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, versions) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{name} [{}]", versions.join(", "))?;
        }
        Ok(())
    }
}

/// Outcome of a route match logged by the router: `"<route>" selected` /
/// `"<route>" discarded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub route: String,
    pub selected: bool,
}

pub fn route_decisions(text: &str) -> Vec<RouteDecision> {
    let re = Regex::new(r#"(?m)"([^"]*)" (selected|discarded)$"#).expect("static regex");
    re.captures_iter(text)
        .map(|caps| RouteDecision {
            route: caps[1].to_owned(),
            selected: &caps[2] == "selected",
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"2024/05/01 10:00:00 [info] 100#100 discovery started
2024/05/01 10:00:00 [notice] 100#100 module: python 3.11.2 "/build/lib/unit/modules/python3.11.unit.so"
2024/05/01 10:00:00 [notice] 100#100 module: python 3.9.18 "/build/lib/unit/modules/python3.9.unit.so"
2024/05/01 10:00:00 [notice] 100#100 module: python 3.11.2 "/build/lib/unit/modules/python3.11-dup.unit.so"
2024/05/01 10:00:00 [notice] 100#100 module: java 17.0.9 "/build/lib/unit/modules/java17.unit.so"
2024/05/01 10:00:00 [info] 101#101 controller started
"routes/0" discarded
"routes/1" selected
"#;

    #[test]
    fn modules_from_log_dedup_versions() {
        let m = AvailableModules::from_log(LOG);
        assert_eq!(m.versions("python"), ["3.11.2", "3.9.18"]);
        assert_eq!(m.versions("java"), ["17.0.9"]);
        assert!(m.versions("ruby").is_empty());
        assert_eq!(m.missing(&["python", "ruby"]), vec!["ruby"]);
    }

    #[test]
    fn features_from_version_output() {
        let out = "unit version: 1.32.0\nconfigured as ./configure --prefix=/x --openssl --njs\n";
        let mut m = AvailableModules::default();
        m.detect_features(out);
        assert!(m.has("openssl") && m.has("njs"));

        let mut plain = AvailableModules::default();
        plain.detect_features("configured as ./configure --openssl-dir=/x");
        assert!(!plain.has("openssl"));
    }

    #[test]
    fn route_lines() {
        assert_eq!(
            route_decisions(LOG),
            vec![
                RouteDecision {
                    route: "routes/0".into(),
                    selected: false
                },
                RouteDecision {
                    route: "routes/1".into(),
                    selected: true
                },
            ]
        );
    }
}
