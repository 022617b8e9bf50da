//! Service namer — pluggable strategies to derive a stable `Service.Name`
//! from raw container metadata, spec §4.3.
//!
//! Grounded on `crates/agent/src/filter/regex.rs` (compile-once
//! `regex::Regex`, small focused helper functions) and the
//! `labels: HashMap<String, String>` field already carried on
//! `crates/agent/src/docker/inventory.rs::ContainerInfo`.

use std::collections::HashMap;

use regex::Regex;

/// Raw container facts a namer strategy can draw on. `names` mirrors
/// Docker's list API, which returns names with a leading `/`; callers are
/// expected to have already stripped it (as
/// `ContainerInfo::from<ContainerSummary>` does in the teacher).
pub struct ContainerFacts<'a> {
    pub first_name: &'a str,
    pub image: &'a str,
    pub labels: &'a HashMap<String, String>,
}

/// A pluggable strategy for deriving `Service.Name`.
pub trait ServiceNamer: Send + Sync {
    fn name(&self, facts: &ContainerFacts<'_>) -> String;
}

/// Applies a regex to the container's first name; if the first capture
/// group matches, returns it, else falls back to the image.
///
/// A `None` pattern (equivalent to the Go source's `nil` regex) always
/// returns `""`.
pub struct RegexNamer {
    pattern: Option<Regex>,
}

impl RegexNamer {
    pub fn new(pattern: Option<Regex>) -> Self {
        Self { pattern }
    }

    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::new(Some(Regex::new(pattern)?)))
    }
}

impl ServiceNamer for RegexNamer {
    fn name(&self, facts: &ContainerFacts<'_>) -> String {
        let Some(re) = &self.pattern else {
            return String::new();
        };
        match re.captures(facts.first_name) {
            Some(caps) => match caps.get(1) {
                Some(m) => m.as_str().to_string(),
                None => facts.image.to_string(),
            },
            None => facts.image.to_string(),
        }
    }
}

/// Returns the value of a specific label if present, else the image.
pub struct LabelNamer {
    label_key: String,
}

impl LabelNamer {
    pub fn new(label_key: impl Into<String>) -> Self {
        Self {
            label_key: label_key.into(),
        }
    }
}

impl ServiceNamer for LabelNamer {
    fn name(&self, facts: &ContainerFacts<'_>) -> String {
        facts
            .labels
            .get(&self.label_key)
            .cloned()
            .unwrap_or_else(|| facts.image.to_string())
    }
}
