//! # Runner Environment
//!
//! Ordered environment of the runner container:
//!
//! 1. variables declared in `runnerPodTemplate.spec.env`, in declared order
//! 2. proxy variables inherited from the controller process
//! 3. built-in runner variables
//!
//! Entries from 2 and 3 are appended only when no earlier entry has the same
//! name, so a user-declared `HTTP_PROXY` wins and is never duplicated.

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector};

/// Proxy variables inherited from the controller, in append order
pub const PROXY_VARIABLES: [&str; 6] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

/// Name of the variable carrying the controller instance identity
pub const INSTANCE_ENV: &str = "TF_CONTROLLER_INSTANCE";

/// Name of the variable pointing at the mounted CLI configuration
pub const CLI_CONFIG_ENV: &str = "TF_CLI_CONFIG_FILE";

/// Plain `name=value` variable
pub fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn field_ref(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

/// Proxy variables set (and non-empty) in the given lookup, in [`PROXY_VARIABLES`] order
pub fn proxy_env<F>(lookup: F) -> Vec<EnvVar>
where
    F: Fn(&str) -> Option<String>,
{
    PROXY_VARIABLES
        .iter()
        .filter_map(|name| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .map(|value| env_var(name, &value))
        })
        .collect()
}

/// Proxy variables of the controller process
pub fn proxy_env_from_process() -> Vec<EnvVar> {
    proxy_env(|name| std::env::var(name).ok())
}

/// Built-in variables every runner receives
pub fn builtin_env(instance_id: &str, cli_config_path: Option<&str>) -> Vec<EnvVar> {
    let mut env = vec![
        field_ref("POD_NAME", "metadata.name"),
        field_ref("POD_NAMESPACE", "metadata.namespace"),
        env_var(INSTANCE_ENV, instance_id),
    ];
    if let Some(path) = cli_config_path {
        env.push(env_var(CLI_CONFIG_ENV, path));
    }
    env
}

/// Merge user, proxy and built-in variables
///
/// Pure in its inputs: feeding the result back in as `user` yields the same list.
pub fn build_runner_env(user: &[EnvVar], proxy: &[EnvVar], builtin: &[EnvVar]) -> Vec<EnvVar> {
    let mut env = user.to_vec();
    for var in proxy.iter().chain(builtin) {
        if !env.iter().any(|existing| existing.name == var.name) {
            env.push(var.clone());
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(env: &[EnvVar]) -> Vec<&str> {
        env.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_proxy_env_skips_unset_and_empty() {
        let proxy = proxy_env(|name| match name {
            "HTTPS_PROXY" => Some("http://proxy:3128".to_string()),
            "no_proxy" => Some(String::new()),
            _ => None,
        });
        assert_eq!(names(&proxy), vec!["HTTPS_PROXY"]);
    }

    #[test]
    fn test_builtin_env_cli_config_only_when_mounted() {
        assert_eq!(
            names(&builtin_env("ctrl-0", None)),
            vec!["POD_NAME", "POD_NAMESPACE", INSTANCE_ENV]
        );
        let with_config = builtin_env("ctrl-0", Some("/etc/tf-cli-config/terraform.rc"));
        assert_eq!(with_config.last().map(|e| e.name.as_str()), Some(CLI_CONFIG_ENV));
    }
}
