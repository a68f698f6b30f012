use anyhow::{Context, Result, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub webserver: Webserver,
    /// Cron expression for repeated vet passes. Without one a single pass runs and the process exits.
    pub schedule: Option<String>,
    pub istio: IstioSettings,
    pub mesh: MeshSettings,
    pub feature_flags: FeatureFlags,
    pub cache_sync_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Webserver { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IstioSettings {
    pub namespace: String,
    pub injector_config_map: String,
    pub injector_config_key: String,
    pub sidecar_container_name: String,
    pub init_container_name: String,
}

impl Default for IstioSettings {
    fn default() -> Self {
        IstioSettings {
            namespace: "istio-system".to_string(),
            injector_config_map: "istio-sidecar-injector".to_string(),
            injector_config_key: "config".to_string(),
            sidecar_container_name: "istio-proxy".to_string(),
            init_container_name: "istio-init".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshSettings {
    pub injection_label: String,
    pub injection_label_value: String,
    pub injected_annotation: String,
    pub excluded_namespaces: Vec<String>,
}

impl Default for MeshSettings {
    fn default() -> Self {
        MeshSettings {
            injection_label: "istio-injection".to_string(),
            injection_label_value: "enabled".to_string(),
            injected_annotation: "sidecar.istio.io/status".to_string(),
            excluded_namespaces: vec![
                "kube-system".to_string(),
                "kube-public".to_string(),
                "istio-system".to_string(),
            ],
        }
    }
}

impl MeshSettings {
    pub fn excluded_namespace_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.excluded_namespaces {
            let glob = Glob::new(pattern)
                .with_context(|| format!("Invalid excluded namespace pattern: {}", pattern))?;
            builder.add(glob);
        }
        builder
            .build()
            .context("Failed to build excluded namespace patterns")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureFlags {
    pub check_component_versions: bool,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Loads the config file when it exists, built-in defaults otherwise.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<Config> {
    if path.as_ref().exists() {
        load_config(path)
    } else {
        info!(
            "Config file {} not found, using defaults",
            path.as_ref().display()
        );
        Ok(Config::default())
    }
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing: Option<String> = None;
    let result = re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            env::var(var_name).unwrap_or_else(|_| {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            })
        })
        .into_owned();

    if let Some(var_name) = missing {
        bail!("Missing environment variable: {}", var_name);
    }
    Ok(result)
}
