use std::collections::BTreeMap;
use std::fmt::Display;

/// Collects `--name=value` command line flags for a component.
///
/// Unset options are skipped. [`FlagBuilder::build`] sorts by flag name so
/// identical configs always render identical command lines.
#[derive(Default, Debug)]
pub struct FlagBuilder {
    flags: Vec<(String, String)>,
}

impl FlagBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a flag unconditionally.
    pub fn set(&mut self, name: &str, value: impl Display) -> &mut Self {
        self.flags.push((name.to_string(), value.to_string()));
        self
    }

    /// Adds a flag if the option is set.
    pub fn opt<T: Display>(&mut self, name: &str, value: &Option<T>) -> &mut Self {
        if let Some(v) = value {
            self.set(name, v);
        }
        self
    }

    /// Adds a flag if the string is non-empty.
    pub fn string(&mut self, name: &str, value: &str) -> &mut Self {
        if !value.is_empty() {
            self.set(name, value);
        }
        self
    }

    /// Adds a comma separated list if non-empty.
    pub fn list(&mut self, name: &str, values: &[String]) -> &mut Self {
        if !values.is_empty() {
            self.set(name, values.join(","));
        }
        self
    }

    /// Adds `k1=v1,k2=v2` if the map is non-empty.
    pub fn map(&mut self, name: &str, values: &BTreeMap<String, String>) -> &mut Self {
        if !values.is_empty() {
            let joined = values
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            self.set(name, joined);
        }
        self
    }

    /// The flags as `--name=value` strings, sorted by name.
    pub fn build(&self) -> Vec<String> {
        let mut flags = self.flags.clone();
        flags.sort_by(|a, b| a.0.cmp(&b.0));
        flags
            .into_iter()
            .map(|(k, v)| format!("--{}={}", k, v))
            .collect()
    }
}
