//! Scoped variable records.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Scope a variable is declared in.
///
/// Declaration order is inheritance order: a variable from a later scope
/// overrides one with the same name and type from an earlier scope. New
/// scopes must be inserted at the position matching that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    Org,
    Template,
    Project,
    Env,
}

impl VariableScope {
    /// All scopes in inheritance order.
    pub const ALL: [VariableScope; 4] = [
        VariableScope::Org,
        VariableScope::Template,
        VariableScope::Project,
        VariableScope::Env,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VariableScope::Org => "org",
            VariableScope::Template => "template",
            VariableScope::Project => "project",
            VariableScope::Env => "env",
        }
    }
}

impl fmt::Display for VariableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariableScope {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "org" => Ok(VariableScope::Org),
            "template" => Ok(VariableScope::Template),
            "project" => Ok(VariableScope::Project),
            "env" => Ok(VariableScope::Env),
            other => Err(ModelError::UnknownValue {
                kind: "variable scope",
                value: other.to_string(),
            }),
        }
    }
}

/// How a variable is handed to the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// Exported into the container environment.
    Environment,
    /// Exported as `TF_VAR_<name>`.
    Terraform,
    /// Written to the configuration-management vars file.
    Ansible,
}

impl VariableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::Environment => "environment",
            VariableType::Terraform => "terraform",
            VariableType::Ansible => "ansible",
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariableType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "environment" => Ok(VariableType::Environment),
            "terraform" => Ok(VariableType::Terraform),
            "ansible" => Ok(VariableType::Ansible),
            other => Err(ModelError::UnknownValue {
                kind: "variable type",
                value: other.to_string(),
            }),
        }
    }
}

/// The part of a variable that is snapshotted into a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableBody {
    pub scope: VariableScope,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl VariableBody {
    pub fn new(
        scope: VariableScope,
        var_type: VariableType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            var_type,
            name: name.into(),
            value: value.into(),
            sensitive: false,
            description: String::new(),
        }
    }

    /// Marks the variable as sensitive.
    pub fn mark_sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Copy with the value blanked when the variable is sensitive.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.sensitive {
            copy.value.clear();
        }
        copy
    }
}

/// A stored variable, owned by the entity of its scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub body: VariableBody,
    pub org_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub tpl_id: String,
    #[serde(default)]
    pub env_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Variable {
    pub fn new(org_id: impl Into<String>, body: VariableBody) -> Self {
        Self {
            id: String::new(),
            body,
            org_id: org_id.into(),
            project_id: String::new(),
            tpl_id: String::new(),
            env_id: String::new(),
            options: Vec::new(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_template(mut self, tpl_id: impl Into<String>) -> Self {
        self.tpl_id = tpl_id.into();
        self
    }

    pub fn with_env(mut self, env_id: impl Into<String>) -> Self {
        self.env_id = env_id.into();
        self
    }

    /// Owning scope path, e.g. `org:o1/tpl:/project:p1/env:`.
    pub fn scope_path(&self) -> String {
        format!(
            "org:{}/tpl:{}/project:{}/env:{}",
            self.org_id, self.tpl_id, self.project_id, self.env_id
        )
    }
}

/// Checks the (scope path, name, type) uniqueness of a variable store.
pub fn validate_unique(variables: &[Variable]) -> Result<(), ModelError> {
    let mut seen = HashSet::new();
    for v in variables {
        let key = (v.scope_path(), v.body.name.as_str(), v.body.var_type);
        if !seen.insert(key) {
            return Err(ModelError::DuplicateVariable {
                scope: v.scope_path(),
                name: v.body.name.clone(),
                var_type: v.body.var_type.to_string(),
            });
        }
    }
    Ok(())
}
