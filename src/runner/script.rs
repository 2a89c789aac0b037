//! Step script rendering.
//!
//! Every step type has one template, compiled once into the `Tera` instance
//! owned by [`ScriptGenerator`]. Rendering only borrows it, so the same
//! context always yields byte-identical scripts.
//!
//! Scripts run from the workspace root. Files at the workspace root are
//! referenced relative to `code/<workdir>` through
//! [`up_to_workspace`](crate::runner::paths::up_to_workspace).

use std::collections::HashMap;

use serde::Serialize;
use tera::{Context, Tera, Value};

use crate::error::ScriptError;
use crate::model::step::StepType;
use crate::runner::paths::{
    is_contained, up_to_workspace, ANSIBLE_INVENTORY_SCRIPT, CLOUDIAC_PLAY_VARS, CLOUDIAC_TF_FILE,
    CODE_DIR, POLICIES_DIR, SCAN_VIOLATION_EXIT_CODE, SSH_KEY_FILE, TERRASCAN_PARSE_FILE,
    TERRASCAN_RESULT_FILE, TF_PLAN_FILE, TF_PLAN_JSON_FILE, TF_STATE_JSON_FILE,
};
use crate::runner::request::RunTaskReq;

const CLONE_TEMPLATE: &str = r#"git clone {{ repo_address | shell_quote }} code && \
cd {{ code_dir | shell_quote }} && \
git checkout -q {{ repo_revision | shell_quote }} && echo check out $(git rev-parse --short HEAD)."#;

const INIT_TEMPLATE: &str = r#"#!/bin/sh
{% include "clone.sh" %} && \
ln -sf {{ iac_tf_file }} . && \
terraform init -input=false{% for arg in step_args %} {{ arg }}{% endfor %}
"#;

const SCAN_INIT_TEMPLATE: &str = r#"#!/bin/sh
{% include "clone.sh" %}
"#;

const PLAN_TEMPLATE: &str = r#"#!/bin/sh
cd {{ code_dir | shell_quote }} && \
terraform plan -input=false -out={{ plan_file }}{% if tf_vars_file %} -var-file={{ tf_vars_file | shell_quote }}{% endif %}{% for arg in step_args %} {{ arg }}{% endfor %} && \
terraform show -no-color -json {{ plan_file }} >{{ plan_json }}
"#;

// Also used for destroy: the destroy plan was produced by the plan step.
const APPLY_TEMPLATE: &str = r#"#!/bin/sh
cd {{ code_dir | shell_quote }} && \
terraform apply -input=false -auto-approve{% for arg in step_args %} {{ arg }}{% endfor %} {{ plan_file }}
"#;

const CONFIGURE_TEMPLATE: &str = r#"#!/bin/sh
export ANSIBLE_HOST_KEY_CHECKING="False"
export ANSIBLE_TF_DIR="."
export ANSIBLE_NOCOWS="1"

cd {{ code_dir | shell_quote }} && ansible-playbook \
--inventory {{ inventory }} \
--user "root" \
--private-key {{ private_key }} \
--extra @{{ play_vars }} \
{% if play_vars_file %}--extra @{{ play_vars_file | shell_quote }} \
{% endif %}{% for arg in step_args %}{{ arg }} \
{% endfor %}{{ playbook | shell_quote }}
"#;

const COMMAND_TEMPLATE: &str = r#"#!/bin/sh
if test -d {{ code_dir | shell_quote }}; then cd {{ code_dir | shell_quote }}; fi
{% for command in step_args %}{{ command }} && \
{% endfor %}true
"#;

const COLLECT_TEMPLATE: &str = r#"#!/bin/sh
cd {{ code_dir | shell_quote }} && \
terraform show -no-color -json >{{ state_json }}
"#;

const PARSE_TEMPLATE: &str = r#"#!/bin/sh
cd {{ code_dir | shell_quote }} && \
terrascan scan --config-only -d . -o json >{{ parse_json }}
"#;

const SCAN_TEMPLATE: &str = r#"#!/bin/sh
cd {{ code_dir | shell_quote }} && \
mkdir -p {{ policies_dir }} && \
echo scanning policies && \
terrascan scan -p {{ policies_dir }} --show-passed --iac-type terraform -l debug -o json >{{ scan_result }}
{% if not stop_on_violation %}RET=$?; [ $RET -eq {{ violation_exit_code }} ] && exit 0 || exit $RET
{% endif %}"#;

/// Template name for a step type.
fn template_name(step_type: StepType) -> &'static str {
    match step_type {
        StepType::Init => "init.sh",
        StepType::ScanInit => "scan-init.sh",
        StepType::Plan => "plan.sh",
        StepType::Apply | StepType::Destroy => "apply.sh",
        StepType::Configure => "configure.sh",
        StepType::Command => "command.sh",
        StepType::Collect => "collect.sh",
        StepType::Parse => "parse.sh",
        StepType::Scan => "scan.sh",
    }
}

/// Inputs of a step script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptContext {
    pub repo_address: String,
    pub repo_revision: String,
    /// Working directory relative to the repository root.
    pub workdir: String,
    /// Extra tool arguments, or the commands of a `command` step.
    pub step_args: Vec<String>,
    pub tf_vars_file: String,
    pub play_vars_file: String,
    pub playbook: String,
    pub stop_on_violation: bool,
    /// Assets directory inside the container.
    pub assets_dir: String,
}

impl ScriptContext {
    pub fn from_request(req: &RunTaskReq, assets_dir: impl Into<String>) -> Self {
        Self {
            repo_address: req.repo_address.clone(),
            repo_revision: req.repo_revision.clone(),
            workdir: req.env.workdir.clone(),
            step_args: req.step_args.clone(),
            tf_vars_file: req.env.tf_vars_file.clone(),
            play_vars_file: req.env.play_vars_file.clone(),
            playbook: req.env.playbook.clone(),
            stop_on_violation: req.stop_on_violation,
            assets_dir: assets_dir.into(),
        }
    }

    fn code_dir(&self) -> String {
        let workdir = self.workdir.trim_matches('/');
        if workdir.is_empty() || workdir == "." {
            CODE_DIR.to_string()
        } else {
            format!("{CODE_DIR}/{workdir}")
        }
    }

    fn up(&self, name: &str) -> String {
        up_to_workspace(&self.workdir, name)
    }

    fn to_tera(&self) -> Result<Context, ScriptError> {
        let mut context =
            Context::from_serialize(self).map_err(|e| ScriptError::Render {
                name: "context".to_string(),
                source: e,
            })?;
        context.insert("code_dir", &self.code_dir());
        context.insert("iac_tf_file", &self.up(CLOUDIAC_TF_FILE));
        context.insert("plan_file", TF_PLAN_FILE);
        context.insert("plan_json", &self.up(TF_PLAN_JSON_FILE));
        context.insert("state_json", &self.up(TF_STATE_JSON_FILE));
        context.insert("parse_json", &self.up(TERRASCAN_PARSE_FILE));
        context.insert("scan_result", &self.up(TERRASCAN_RESULT_FILE));
        context.insert("policies_dir", &self.up(POLICIES_DIR));
        context.insert("private_key", &self.up(SSH_KEY_FILE));
        context.insert("play_vars", &self.up(CLOUDIAC_PLAY_VARS));
        context.insert(
            "inventory",
            &format!(
                "{}/{}",
                self.assets_dir.trim_end_matches('/'),
                ANSIBLE_INVENTORY_SCRIPT
            ),
        );
        context.insert("violation_exit_code", &SCAN_VIOLATION_EXIT_CODE);
        Ok(context)
    }
}

/// Renders step scripts from pre-compiled templates.
#[derive(Debug)]
pub struct ScriptGenerator {
    tera: Tera,
}

impl ScriptGenerator {
    /// Compiles all step templates.
    ///
    /// # Errors
    /// Returns `ScriptError::Compile` if a template does not parse.
    pub fn new() -> Result<Self, ScriptError> {
        let mut tera = Tera::default();
        tera.autoescape_on(Vec::new());
        tera.register_filter("shell_quote", shell_quote_filter);
        tera.add_raw_templates(vec![
            ("clone.sh", CLONE_TEMPLATE),
            ("init.sh", INIT_TEMPLATE),
            ("scan-init.sh", SCAN_INIT_TEMPLATE),
            ("plan.sh", PLAN_TEMPLATE),
            ("apply.sh", APPLY_TEMPLATE),
            ("configure.sh", CONFIGURE_TEMPLATE),
            ("command.sh", COMMAND_TEMPLATE),
            ("collect.sh", COLLECT_TEMPLATE),
            ("parse.sh", PARSE_TEMPLATE),
            ("scan.sh", SCAN_TEMPLATE),
        ])
        .map_err(ScriptError::Compile)?;
        Ok(Self { tera })
    }

    /// Renders the script for a step.
    ///
    /// # Errors
    /// `InvalidWorkdir` if the working directory leaves the repository,
    /// `MissingField` when a required input is empty, `Render` on template
    /// failures.
    pub fn render(&self, step_type: StepType, ctx: &ScriptContext) -> Result<String, ScriptError> {
        if !is_contained(&ctx.workdir) {
            return Err(ScriptError::InvalidWorkdir(ctx.workdir.clone()));
        }
        check_required(step_type, ctx)?;

        let name = template_name(step_type);
        self.tera
            .render(name, &ctx.to_tera()?)
            .map_err(|e| ScriptError::Render {
                name: name.to_string(),
                source: e,
            })
    }
}

fn check_required(step_type: StepType, ctx: &ScriptContext) -> Result<(), ScriptError> {
    let missing = |field: &str| ScriptError::MissingField {
        step: step_type.to_string(),
        field: field.to_string(),
    };

    match step_type {
        StepType::Init | StepType::ScanInit => {
            if ctx.repo_address.is_empty() {
                return Err(missing("repo_address"));
            }
            if ctx.repo_revision.is_empty() {
                return Err(missing("repo_revision"));
            }
        }
        StepType::Configure if ctx.playbook.is_empty() => return Err(missing("playbook")),
        _ => {}
    }
    Ok(())
}

/// Quotes a value for POSIX sh, leaving plain words untouched.
pub fn shell_quote(value: &str) -> String {
    let plain = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c);
    if !value.is_empty() && value.chars().all(plain) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r#"'\''"#))
    }
}

fn shell_quote_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return Err(tera::Error::msg("shell_quote expects a scalar value")),
    };
    Ok(Value::String(shell_quote(&s)))
}
