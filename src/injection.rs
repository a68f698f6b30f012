use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

// Go template actions with either the `[[ ]]` or the `{{ }}` delimiters, including trim markers.
static TEMPLATE_ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(?:\[\[|\{\{)(-\s)?(.*?)(\s-)?(?:\]\]|\}\})")
        .expect("template action pattern is valid")
});

/// The init and sidecar images the injector applies to newly created workloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePair {
    pub init: String,
    pub sidecar: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("sidecar injection is disabled: {0}")]
    Disabled(String),

    #[error("sidecar injector config {0} not found")]
    NotFound(String),

    #[error("malformed sidecar injector config: {0}")]
    Malformed(String),

    #[error("failed to get inject images: injector config has no init or sidecar image")]
    Incomplete,
}

#[derive(Debug, Default, Deserialize)]
pub struct InjectedContainer {
    #[serde(default)]
    pub image: Option<String>,
}

/// The container lists the injector adds to a pod.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarInjectionSpec {
    #[serde(default)]
    pub init_containers: Vec<InjectedContainer>,
    #[serde(default)]
    pub containers: Vec<InjectedContainer>,
}

#[derive(Debug, Deserialize)]
struct InjectorConfig {
    #[serde(default = "default_policy")]
    policy: String,
    #[serde(default)]
    template: String,
}

fn default_policy() -> String {
    "enabled".to_string()
}

/// Source of the injector's current configuration.
pub trait ConfigStore {
    fn injection_spec(&self) -> Result<SidecarInjectionSpec, ResolveError>;
}

/// Parses the injector config document: a `policy` plus a `template` that renders to the
/// injected containers.
pub fn parse_injector_config(raw: &str) -> Result<SidecarInjectionSpec, ResolveError> {
    let config: InjectorConfig =
        serde_yaml_ng::from_str(raw).map_err(|e| ResolveError::Malformed(e.to_string()))?;

    if config.policy.eq_ignore_ascii_case("disabled") {
        return Err(ResolveError::Disabled(format!(
            "injection policy is {}",
            config.policy
        )));
    }
    if config.template.trim().is_empty() {
        return Err(ResolveError::Malformed("template is empty".to_string()));
    }

    let rendered = render_template(&config.template)?;
    debug!("Rendered injector template:\n{}", rendered);
    serde_yaml_ng::from_str(&rendered)
        .map_err(|e| ResolveError::Malformed(format!("template: {}", e)))
}

struct Branch {
    parent_active: bool,
    taken: bool,
    active: bool,
}

fn is_active(stack: &[Branch]) -> bool {
    stack.last().is_none_or(|branch| branch.active)
}

/// Decides a conditional as it would be for a pod without annotations.
///
/// Annotation presence checks are false, anything else holds.
fn condition_holds(pipeline: &str) -> bool {
    let pipeline = pipeline.trim().trim_start_matches('(').trim_start();
    if let Some(rest) = pipeline.strip_prefix("not ") {
        return !condition_holds(rest);
    }
    !pipeline.starts_with("isset")
}

/// Renders the injector template for a bare pod.
///
/// Control actions follow Go template semantics including `-` whitespace trimming.
/// Value actions render as empty strings, `range` and `define` bodies are skipped.
fn render_template(template: &str) -> Result<String, ResolveError> {
    let mut out = String::with_capacity(template.len());
    let mut stack: Vec<Branch> = Vec::new();
    let mut trim_next = false;
    let mut last = 0;

    for caps in TEMPLATE_ACTION.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let mut text = &template[last..whole.start()];
        if trim_next {
            text = text.trim_start();
        }
        if caps.get(1).is_some() {
            text = text.trim_end();
        }
        if is_active(&stack) {
            out.push_str(text);
        }
        trim_next = caps.get(3).is_some();
        last = whole.end();

        let action = caps.get(2).map_or("", |m| m.as_str()).trim();
        let (keyword, rest) = action
            .split_once(char::is_whitespace)
            .unwrap_or((action, ""));
        match keyword {
            "if" | "with" | "block" | "range" | "define" => {
                let parent_active = is_active(&stack);
                let holds = match keyword {
                    "if" | "with" => condition_holds(rest),
                    "block" => true,
                    _ => false,
                };
                let active = parent_active && holds;
                stack.push(Branch {
                    parent_active,
                    taken: active,
                    active,
                });
            }
            "else" => {
                let branch = stack.last_mut().ok_or_else(|| {
                    ResolveError::Malformed("template: else without if".to_string())
                })?;
                let rest = rest.trim();
                let holds = match rest.split_once(char::is_whitespace) {
                    Some(("if" | "with", pipeline)) => condition_holds(pipeline),
                    _ => true,
                };
                branch.active = branch.parent_active && !branch.taken && holds;
                branch.taken |= branch.active;
            }
            "end" => {
                stack.pop().ok_or_else(|| {
                    ResolveError::Malformed("template: end without block".to_string())
                })?;
            }
            _ => {}
        }
    }

    let mut text = &template[last..];
    if trim_next {
        text = text.trim_start();
    }
    if is_active(&stack) {
        out.push_str(text);
    }
    if !stack.is_empty() {
        return Err(ResolveError::Malformed(
            "template: unclosed block".to_string(),
        ));
    }
    Ok(out)
}

fn first_image(containers: &[InjectedContainer]) -> Option<String> {
    containers
        .iter()
        .filter_map(|c| c.image.as_deref())
        .find(|image| !image.is_empty())
        .map(str::to_owned)
}

/// Fetches the injector config fresh and picks the first init and the first sidecar image from it.
pub fn resolve_injected_images<S: ConfigStore + ?Sized>(
    store: &S,
) -> Result<ImagePair, ResolveError> {
    let spec = store.injection_spec()?;

    match (first_image(&spec.init_containers), first_image(&spec.containers)) {
        (Some(init), Some(sidecar)) => Ok(ImagePair { init, sidecar }),
        _ => {
            let err = ResolveError::Incomplete;
            warn!("{}", err);
            Err(err)
        }
    }
}
