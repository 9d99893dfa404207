use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use crate::ast::{MemberDesc, MethodDesc, TypeDesc, well_known};
use crate::config::{ConfigError, ConfigResult, KnownTypesConfig};

lazy_static! {
    static ref BUILTIN_TYPES: HashSet<&'static str> = [
        well_known::UNIT,
        well_known::BOOL,
        well_known::INT,
        well_known::FLOAT,
        well_known::STRING,
        well_known::OBJECT,
        well_known::LIST,
        well_known::PROPERTY_BAG,
        well_known::OBSERVABLE,
        well_known::ENUMERABLE,
        well_known::FUNCTION,
        well_known::EXCEPTION,
    ]
    .into_iter()
    .collect();
}

/// Types and members both sides of a session agree on.
///
/// Anything outside this set is either rewritten by the local evaluation
/// visitor or rejected by the security visitor.
#[derive(Debug, Clone, Default)]
pub struct KnownTypeRegistry {
    names: HashSet<String>,
    patterns: Vec<Regex>,
    members: HashSet<String>,
}

impl KnownTypeRegistry {
    /// Built-in types only.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &KnownTypesConfig) -> ConfigResult<Self> {
        let mut registry = Self::new();
        for name in &config.names {
            registry.names.insert(name.clone());
        }
        for pattern in &config.patterns {
            registry = registry.with_pattern(pattern)?;
        }
        for member in &config.members {
            registry.members.insert(member.clone());
        }
        Ok(registry)
    }

    pub fn with_type<S: Into<String>>(mut self, name: S) -> Self {
        self.names.insert(name.into());
        self
    }

    /// Adds a pattern matched against whole type names.
    pub fn with_pattern(mut self, pattern: &str) -> ConfigResult<Self> {
        let anchored = format!("^(?:{})$", pattern);
        let regex = Regex::new(&anchored).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        self.patterns.push(regex);
        Ok(self)
    }

    /// Adds a `Type.Member` key that is known even if its type is not.
    pub fn with_member<S: Into<String>>(mut self, key: S) -> Self {
        self.members.insert(key.into());
        self
    }

    pub fn is_known_name(&self, name: &str) -> bool {
        BUILTIN_TYPES.contains(name)
            || self.names.contains(name)
            || self.patterns.iter().any(|p| p.is_match(name))
    }

    /// A type is known when its name and every type it mentions are known.
    /// Generated types never are.
    pub fn is_known_type(&self, ty: &TypeDesc) -> bool {
        match ty {
            TypeDesc::Named { name, args } => {
                self.is_known_name(name) && args.iter().all(|a| self.is_known_type(a))
            }
            TypeDesc::Array(element) => self.is_known_type(element),
            TypeDesc::Function { params, ret } => {
                params.iter().all(|p| self.is_known_type(p)) && self.is_known_type(ret)
            }
            TypeDesc::Generated { .. } => false,
            TypeDesc::GenericParam(_) => true,
        }
    }

    pub fn is_known_member(&self, member: &MemberDesc) -> bool {
        self.members.contains(&member.key()) || self.is_known_type(member.declaring())
    }

    pub fn is_known_method(&self, method: &MethodDesc) -> bool {
        self.members.contains(&method.key())
            || (self.is_known_type(method.declaring())
                && method.type_args().iter().all(|t| self.is_known_type(t)))
    }
}
