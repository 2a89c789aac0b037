//! Fixed names and path helpers of the task workspace layout.
//!
//! ```text
//! <storage>/<env-id>/<task-id>/
//!   ssh_key
//!   cloudiac.tf
//!   cloudiac_play_vars.yml
//!   policies/<policy-id>/{meta.json,policy.rego}
//!   step<N>/{script.sh,step.log,step-info.json}
//!   code/<workdir>/
//! ```

use std::path::{Component, Path, PathBuf};

pub const TASK_STEP_SCRIPT_NAME: &str = "script.sh";
pub const TASK_STEP_LOG_NAME: &str = "step.log";
pub const TASK_STEP_INFO_FILE_NAME: &str = "step-info.json";

pub const SSH_KEY_FILE: &str = "ssh_key";
pub const CLOUDIAC_TF_FILE: &str = "cloudiac.tf";
pub const CLOUDIAC_PLAY_VARS: &str = "cloudiac_play_vars.yml";
pub const POLICIES_DIR: &str = "policies";
pub const POLICY_META_FILE: &str = "meta.json";
pub const POLICY_REGO_FILE: &str = "policy.rego";
/// Directory the repository is cloned into.
pub const CODE_DIR: &str = "code";

pub const TF_PLAN_FILE: &str = "_cloudiac.tfplan";
pub const TF_PLAN_JSON_FILE: &str = "tfplan.json";
pub const TF_STATE_JSON_FILE: &str = "tfstate.json";
pub const TF_PROVIDER_SCHEMA_FILE: &str = "provider_schema.json";
pub const TERRASCAN_PARSE_FILE: &str = "tfparse.json";
pub const TERRASCAN_RESULT_FILE: &str = "tfscan_result.json";

/// Inventory script shipped in the worker image's assets directory.
pub const ANSIBLE_INVENTORY_SCRIPT: &str = "terraform.py";

/// Exit code the policy scanner uses for "violations found".
pub const SCAN_VIOLATION_EXIT_CODE: i64 = 3;

/// `step<N>`
pub fn step_dir_name(index: u32) -> String {
    format!("step{index}")
}

/// Host directory of one task run.
pub fn task_workspace(storage: &Path, env_id: &str, task_id: &str) -> PathBuf {
    storage.join(env_id).join(task_id)
}

/// Host directory of one step inside a task workspace.
pub fn step_dir(workspace: &Path, index: u32) -> PathBuf {
    workspace.join(step_dir_name(index))
}

/// Whether `path` stays inside the directory it is joined to.
///
/// Empty and `.`-prefixed paths are fine; absolute paths and any `..`
/// component are not.
pub fn is_contained(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Whether `name` is exactly one plain path segment.
pub fn is_single_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('/')
}

/// Path of a workspace-root file as seen from `code/<workdir>`.
///
/// One `..` for the `code` directory plus one per real component of the
/// working directory.
pub fn up_to_workspace(workdir: &str, name: &str) -> String {
    let depth = 1 + Path::new(workdir)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    let mut parts = vec![".."; depth];
    parts.push(name);
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_to_workspace() {
        assert_eq!(up_to_workspace("", "cloudiac.tf"), "../cloudiac.tf");
        assert_eq!(up_to_workspace("infra", "ssh_key"), "../../ssh_key");
        assert_eq!(up_to_workspace("infra/prod/", "tfplan.json"), "../../../tfplan.json");
        assert_eq!(up_to_workspace("./infra", "policies"), "../../policies");
    }

    #[test]
    fn test_is_contained() {
        assert!(is_contained(""));
        assert!(is_contained("infra/prod"));
        assert!(is_contained("./infra"));
        assert!(!is_contained("../secrets"));
        assert!(!is_contained(".."));
        assert!(!is_contained("infra/../../etc"));
        assert!(!is_contained("/etc"));
    }

    #[test]
    fn test_is_single_segment() {
        assert!(is_single_segment("po-123"));
        assert!(!is_single_segment(""));
        assert!(!is_single_segment("a/b"));
        assert!(!is_single_segment(".."));
        assert!(!is_single_segment("."));
    }

    #[test]
    fn test_layout() {
        let ws = task_workspace(Path::new("/data"), "env-1", "task-1");
        assert_eq!(ws, PathBuf::from("/data/env-1/task-1"));
        assert_eq!(step_dir(&ws, 2), PathBuf::from("/data/env-1/task-1/step2"));
    }
}
