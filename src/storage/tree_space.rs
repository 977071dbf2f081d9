use crate::config::{DEFAULT_TREE_SPACE, SchemataConfig};
use crate::error::SchemataError;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;

const SCHEMA_PLACEHOLDER: &str = "${schema}";

/// One `treespace.<name>=<glob>:<volume template>` entry.
#[derive(Debug, Clone)]
pub struct TreeSpaceRule {
    pub name: String,
    pub pattern: String,
    pub template: String,
    compiled: Regex,
}

impl TreeSpaceRule {
    pub fn matches(&self, schema: &str) -> bool {
        self.compiled.is_match(schema)
    }
}

/// Outcome of resolving a schema, reported by tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Rule name, or `.default` when the fallback was used.
    pub rule: String,
    pub template: String,
    pub volume: String,
}

/// Ordered schema-name rules mapping to volume templates. Pattern rules are
/// tried in name order; the `.default` entry is consulted last and only by
/// exact key.
#[derive(Debug, Clone, Default)]
pub struct TreeSpaceRules {
    rules: Vec<TreeSpaceRule>,
    default_template: Option<String>,
    properties: BTreeMap<String, String>,
}

impl TreeSpaceRules {
    pub fn from_config(config: &SchemataConfig) -> Self {
        Self::parse(&config.tree_spaces, &config.volume_properties)
    }

    /// Malformed entries and repeated patterns are logged and skipped.
    pub fn parse(
        tree_spaces: &BTreeMap<String, String>,
        properties: &BTreeMap<String, String>,
    ) -> Self {
        let mut rules = Vec::new();
        let mut default_template = None;
        let mut seen = HashSet::new();
        for (name, value) in tree_spaces {
            if name == DEFAULT_TREE_SPACE {
                default_template = Some(value.clone());
                continue;
            }
            let Some((pattern, template)) = value.split_once(':') else {
                warn!(tree_space = %name, value = %value, "ignoring tree space without pattern");
                continue;
            };
            if pattern.is_empty() || template.is_empty() {
                warn!(tree_space = %name, value = %value, "ignoring incomplete tree space");
                continue;
            }
            if !seen.insert(pattern.to_string()) {
                warn!(tree_space = %name, pattern, "ignoring duplicate tree space pattern");
                continue;
            }
            let compiled = match compile_glob(pattern) {
                Ok(compiled) => compiled,
                Err(err) => {
                    warn!(tree_space = %name, pattern, error = %err, "ignoring invalid tree space pattern");
                    continue;
                }
            };
            rules.push(TreeSpaceRule {
                name: name.clone(),
                pattern: pattern.to_string(),
                template: template.to_string(),
                compiled,
            });
        }
        Self {
            rules,
            default_template,
            properties: properties.clone(),
        }
    }

    pub fn rules(&self) -> &[TreeSpaceRule] {
        &self.rules
    }

    pub fn default_template(&self) -> Option<&str> {
        self.default_template.as_deref()
    }

    pub fn resolve(&self, schema: &str) -> Option<Resolution> {
        if let Some(rule) = self.rules.iter().find(|r| r.matches(schema)) {
            return Some(Resolution {
                rule: rule.name.clone(),
                template: rule.template.clone(),
                volume: self.substitute(&rule.template, schema),
            });
        }
        self.default_template.as_ref().map(|template| Resolution {
            rule: DEFAULT_TREE_SPACE.to_string(),
            template: template.clone(),
            volume: self.substitute(template, schema),
        })
    }

    /// Volume specification for `schema`, ready for the engine's loader.
    pub fn volume_for(&self, schema: &str) -> Result<String, SchemataError> {
        self.resolve(schema)
            .map(|r| r.volume)
            .ok_or_else(|| SchemataError::NoVolumeForSchema {
                schema: schema.to_string(),
            })
    }

    /// Every volume the rules can name for `schemas`, plus the volumes of
    /// templates that do not depend on the schema name.
    pub fn known_volumes<'a, I>(&self, schemas: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let templates = self
            .rules
            .iter()
            .map(|r| r.template.as_str())
            .chain(self.default_template.as_deref());
        let mut volumes: BTreeSet<String> = templates
            .filter(|t| !t.contains(SCHEMA_PLACEHOLDER))
            .map(|t| self.substitute(t, ""))
            .collect();
        for schema in schemas {
            if let Some(resolution) = self.resolve(schema) {
                volumes.insert(resolution.volume);
            }
        }
        volumes
    }

    fn substitute(&self, template: &str, schema: &str) -> String {
        let mut out = template.replace(SCHEMA_PLACEHOLDER, schema);
        for (key, value) in &self.properties {
            out = out.replace(&format!("${{{key}}}"), value);
        }
        out
    }
}

/// Compiles a tree-space glob: `*` matches any run, `?` one character,
/// letters match themselves and everything else is literal.
pub fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if c.is_alphabetic() => out.push(c),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    Regex::new(&out)
}
