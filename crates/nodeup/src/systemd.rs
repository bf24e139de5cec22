//! systemd unit files.

use std::fmt::Write;

/// A unit file under construction.
///
/// Sections render in the order they were first used and keys keep their
/// insertion order, so repeated keys such as `ExecStartPre` stay ordered.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl Manifest {
    /// An empty unit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `key=value` to `section`.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.sections.iter_mut().find(|(name, _)| name == section) {
            Some((_, entries)) => entries.push((key.to_string(), value)),
            None => self
                .sections
                .push((section.to_string(), vec![(key.to_string(), value)])),
        }
        self
    }

    /// Renders the unit text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, (section, entries)) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", section);
            for (key, value) in entries {
                let _ = writeln!(out, "{}={}", key, value);
            }
        }
        out
    }
}

/// Every value of `key` in `unit`, across all sections.
pub fn values<'a>(unit: &'a str, key: &str) -> Vec<&'a str> {
    unit.lines()
        .filter_map(|line| {
            let (k, v) = line.trim().split_once('=')?;
            if k.trim() == key {
                Some(v.trim())
            } else {
                None
            }
        })
        .collect()
}

/// Files whose contents the unit reads on start: environment files and the
/// main binary.
pub fn file_dependencies(unit: &str) -> Vec<String> {
    let mut deps = Vec::new();
    for value in values(unit, "EnvironmentFile") {
        deps.push(value.trim_start_matches('-').to_string());
    }
    for value in values(unit, "ExecStart") {
        let binary = value.trim_start_matches(|c| matches!(c, '-' | '@' | '+' | '!' | ':'));
        if let Some(binary) = binary.split_whitespace().next() {
            if binary.starts_with('/') {
                deps.push(binary.to_string());
            }
        }
    }
    deps
}
