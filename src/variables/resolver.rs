//! Scope inheritance for task variables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SecretError;
use crate::model::variable::{Variable, VariableBody, VariableScope, VariableType};
use crate::variables::secret::SecretCipher;

/// Owning ids of the environment being resolved for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeIds {
    pub org_id: String,
    #[serde(default)]
    pub tpl_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub env_id: String,
}

/// Resolved variables grouped the way a run request carries them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVars {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub terraform: BTreeMap<String, String>,
    #[serde(default)]
    pub ansible: BTreeMap<String, String>,
}

/// Merges org, template, project and env variables into the effective set.
#[derive(Debug, Clone)]
pub struct VariableResolver {
    scope: ScopeIds,
}

impl VariableResolver {
    pub fn new(scope: ScopeIds) -> Self {
        Self { scope }
    }

    /// Whether a stored variable is visible to this environment.
    pub fn applies_to(&self, variable: &Variable) -> bool {
        if variable.org_id != self.scope.org_id {
            return false;
        }
        match variable.body.scope {
            VariableScope::Org => true,
            VariableScope::Template => {
                !self.scope.tpl_id.is_empty() && variable.tpl_id == self.scope.tpl_id
            }
            VariableScope::Project => {
                !self.scope.project_id.is_empty() && variable.project_id == self.scope.project_id
            }
            VariableScope::Env => {
                !self.scope.env_id.is_empty() && variable.env_id == self.scope.env_id
            }
        }
    }

    /// Produces the effective variables, sorted by (type, name).
    ///
    /// A variable from a narrower scope replaces one with the same name and
    /// type from a broader scope. Values are returned as stored; sealed
    /// values stay sealed.
    ///
    /// # Arguments
    /// * `variables` - Stored variables of any scope; unrelated ones are skipped
    /// * `filter` - Only keep variables of this type when set
    pub fn resolve(&self, variables: &[Variable], filter: Option<VariableType>) -> Vec<VariableBody> {
        let mut applicable: Vec<&Variable> = variables
            .iter()
            .filter(|v| self.applies_to(v))
            .filter(|v| filter.map_or(true, |t| v.body.var_type == t))
            .collect();
        // Stable, so equal scopes keep input order and the later one wins.
        applicable.sort_by_key(|v| v.body.scope);

        let mut effective: BTreeMap<(VariableType, &str), &VariableBody> = BTreeMap::new();
        for v in applicable {
            effective.insert((v.body.var_type, v.body.name.as_str()), &v.body);
        }

        debug!(
            env_id = %self.scope.env_id,
            count = effective.len(),
            "Resolved variables"
        );
        effective.into_values().cloned().collect()
    }

    /// Like [`resolve`](Self::resolve), with every value decrypted.
    ///
    /// # Errors
    /// Returns `SecretError::Variable` naming the first value that fails to
    /// decrypt; nothing is returned in that case.
    pub fn resolve_decrypted(
        &self,
        variables: &[Variable],
        filter: Option<VariableType>,
        cipher: &dyn SecretCipher,
    ) -> Result<Vec<VariableBody>, SecretError> {
        decrypt_all(&self.resolve(variables, filter), cipher)
    }
}

/// Decrypts every value, failing as a whole on the first bad one.
pub fn decrypt_all(
    variables: &[VariableBody],
    cipher: &dyn SecretCipher,
) -> Result<Vec<VariableBody>, SecretError> {
    variables
        .iter()
        .map(|v| {
            let value = cipher.decrypt(&v.value).map_err(|e| SecretError::Variable {
                name: v.name.clone(),
                source: Box::new(e),
            })?;
            Ok(VariableBody {
                value,
                ..v.clone()
            })
        })
        .collect()
}

/// Decrypts the values of a name to value map.
pub fn decrypt_map(
    vars: &BTreeMap<String, String>,
    cipher: &dyn SecretCipher,
) -> Result<BTreeMap<String, String>, SecretError> {
    vars.iter()
        .map(|(name, value)| {
            let plain = cipher.decrypt(value).map_err(|e| SecretError::Variable {
                name: name.clone(),
                source: Box::new(e),
            })?;
            Ok((name.clone(), plain))
        })
        .collect()
}

/// Groups resolved variables by type.
pub fn split_by_type(variables: &[VariableBody]) -> ResolvedVars {
    let mut resolved = ResolvedVars::default();
    for v in variables {
        let target = match v.var_type {
            VariableType::Environment => &mut resolved.environment,
            VariableType::Terraform => &mut resolved.terraform,
            VariableType::Ansible => &mut resolved.ansible,
        };
        target.insert(v.name.clone(), v.value.clone());
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::secret::SealedCipher;

    fn scope() -> ScopeIds {
        ScopeIds {
            org_id: "o1".to_string(),
            tpl_id: "tpl1".to_string(),
            project_id: "p1".to_string(),
            env_id: "e1".to_string(),
        }
    }

    fn var(scope: VariableScope, var_type: VariableType, name: &str, value: &str) -> Variable {
        let v = Variable::new("o1", VariableBody::new(scope, var_type, name, value));
        match scope {
            VariableScope::Org => v,
            VariableScope::Template => v.with_template("tpl1"),
            VariableScope::Project => v.with_project("p1"),
            VariableScope::Env => v.with_project("p1").with_env("e1"),
        }
    }

    #[test]
    fn test_narrower_scope_overrides() {
        let resolver = VariableResolver::new(scope());
        // Deliberately out of scope order.
        let vars = vec![
            var(VariableScope::Env, VariableType::Terraform, "region", "env"),
            var(VariableScope::Org, VariableType::Terraform, "region", "org"),
            var(VariableScope::Project, VariableType::Terraform, "region", "project"),
            var(VariableScope::Template, VariableType::Terraform, "size", "small"),
        ];

        let resolved = resolver.resolve(&vars, None);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].name, "region");
        assert_eq!(resolved[0].value, "env");
        assert_eq!(resolved[0].scope, VariableScope::Env);
        assert_eq!(resolved[1].name, "size");
    }

    #[test]
    fn test_same_name_different_type_are_distinct() {
        let resolver = VariableResolver::new(scope());
        let vars = vec![
            var(VariableScope::Org, VariableType::Terraform, "region", "tf"),
            var(VariableScope::Env, VariableType::Environment, "region", "env"),
        ];
        let resolved = resolver.resolve(&vars, None);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].var_type, VariableType::Environment);
        assert_eq!(resolved[1].var_type, VariableType::Terraform);

        let only_tf = resolver.resolve(&vars, Some(VariableType::Terraform));
        assert_eq!(only_tf.len(), 1);
        assert_eq!(only_tf[0].value, "tf");
    }

    #[test]
    fn test_foreign_scopes_are_skipped() {
        let resolver = VariableResolver::new(scope());
        let other_env = Variable::new(
            "o1",
            VariableBody::new(VariableScope::Env, VariableType::Environment, "A", "x"),
        )
        .with_env("e2");
        let other_org = Variable::new(
            "o2",
            VariableBody::new(VariableScope::Org, VariableType::Environment, "B", "y"),
        );
        assert!(resolver.resolve(&[other_env, other_org], None).is_empty());
    }

    #[test]
    fn test_resolve_does_not_mutate_records() {
        let cipher = SealedCipher::new("k").expect("cipher");
        let sealed = cipher.encrypt("hunter2").expect("encrypt");
        let vars = vec![var(
            VariableScope::Env,
            VariableType::Environment,
            "PASSWORD",
            &sealed,
        )];

        let resolver = VariableResolver::new(scope());
        let resolved = resolver
            .resolve_decrypted(&vars, None, &cipher)
            .expect("decrypt");
        assert_eq!(resolved[0].value, "hunter2");
        assert_eq!(vars[0].body.value, sealed);
    }

    #[test]
    fn test_one_bad_value_fails_everything() {
        let cipher = SealedCipher::new("k").expect("cipher");
        let foreign = SealedCipher::new("other")
            .expect("cipher")
            .encrypt("x")
            .expect("encrypt");
        let vars = vec![
            var(VariableScope::Env, VariableType::Environment, "A", "plain"),
            var(VariableScope::Env, VariableType::Environment, "B", &foreign),
        ];

        let err = VariableResolver::new(scope())
            .resolve_decrypted(&vars, None, &cipher)
            .unwrap_err();
        match err {
            SecretError::Variable { name, .. } => assert_eq!(name, "B"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_split_by_type() {
        let resolver = VariableResolver::new(scope());
        let vars = vec![
            var(VariableScope::Org, VariableType::Environment, "TOKEN", "t"),
            var(VariableScope::Org, VariableType::Terraform, "region", "eu"),
            var(VariableScope::Org, VariableType::Ansible, "user", "root"),
        ];
        let split = split_by_type(&resolver.resolve(&vars, None));
        assert_eq!(split.environment.get("TOKEN").map(String::as_str), Some("t"));
        assert_eq!(split.terraform.get("region").map(String::as_str), Some("eu"));
        assert_eq!(split.ansible.get("user").map(String::as_str), Some("root"));
    }

    #[test]
    fn test_decrypt_map() {
        let cipher = SealedCipher::new("k").expect("cipher");
        let mut vars = BTreeMap::new();
        vars.insert("A".to_string(), cipher.encrypt("1").expect("encrypt"));
        vars.insert("B".to_string(), "2".to_string());
        let plain = decrypt_map(&vars, &cipher).expect("decrypt");
        assert_eq!(plain["A"], "1");
        assert_eq!(plain["B"], "2");
    }
}
