use regex::{Captures, Regex};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Placeholder name to value. Key-sorted, so serialization order never depends on insertion order.
pub type Attributes = BTreeMap<String, String>;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)}").expect("placeholder pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoteType {
    InitImageMismatch,
    SidecarImageMismatch,
    MissingVersion,
    #[serde(rename = "istio-component-mismatch")]
    ComponentMismatch,
}

impl NoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteType::InitImageMismatch => "init-image-mismatch",
            NoteType::SidecarImageMismatch => "sidecar-image-mismatch",
            NoteType::MissingVersion => "missing-version",
            NoteType::ComponentMismatch => "istio-component-mismatch",
        }
    }
}

impl fmt::Display for NoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NoteLevel {
    Info,
    Warning,
    #[allow(dead_code)]
    Error,
}

/// A diagnostic record produced by a vet pass.
///
/// `summary` and `message` are templates with `${name}` placeholders that are
/// filled from `attributes` by whoever presents the note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Note {
    pub id: String,
    #[serde(rename = "type")]
    pub note_type: NoteType,
    pub summary: &'static str,
    #[serde(rename = "msg")]
    pub message: &'static str,
    pub level: NoteLevel,
    #[serde(rename = "attr")]
    pub attributes: Attributes,
}

#[derive(Serialize)]
struct IdentityContent<'a> {
    #[serde(rename = "type")]
    note_type: NoteType,
    summary: &'a str,
    message: &'a str,
    attributes: &'a Attributes,
}

impl Note {
    pub fn new(
        note_type: NoteType,
        summary: &'static str,
        message: &'static str,
        level: NoteLevel,
        attributes: Attributes,
    ) -> Self {
        Note {
            id: String::new(),
            note_type,
            summary,
            message,
            level,
            attributes,
        }
    }

    #[cfg(test)]
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn rendered_summary(&self) -> String {
        render(self.summary, &self.attributes)
    }

    pub fn rendered_message(&self) -> String {
        render(self.message, &self.attributes)
    }
}

/// SHA-256 over the canonical JSON form of everything except `id` and `level`.
pub fn compute_id(note: &Note) -> String {
    let content = IdentityContent {
        note_type: note.note_type,
        summary: note.summary,
        message: note.message,
        attributes: &note.attributes,
    };
    // Serializing plain strings and a string map cannot fail.
    let bytes = serde_json::to_vec(&content).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

pub fn stamp(mut note: Note) -> Note {
    note.id = compute_id(&note);
    note
}

pub fn stamp_all(notes: Vec<Note>) -> Vec<Note> {
    notes.into_iter().map(stamp).collect()
}

/// Replaces `${name}` placeholders with attribute values. Unknown placeholders are left as they are.
pub fn render(template: &str, attributes: &Attributes) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match attributes.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
pub(crate) fn compare_notes(a: &Note, b: &Note) -> std::cmp::Ordering {
    let key = |n: &Note| {
        let (observed, desired) = match n.note_type {
            NoteType::InitImageMismatch => (n.attr("init_image"), n.attr("inject_init_image")),
            NoteType::SidecarImageMismatch => {
                (n.attr("sidecar_image"), n.attr("inject_sidecar_image"))
            }
            NoteType::ComponentMismatch => (n.attr("component_name"), n.attr("component_version")),
            NoteType::MissingVersion => (None, None),
        };
        (
            n.attr("namespace").map(str::to_owned),
            n.attr("pod_name").map(str::to_owned),
            n.note_type,
            observed.map(str::to_owned),
            desired.map(str::to_owned),
        )
    };
    key(a).cmp(&key(b))
}

#[cfg(test)]
pub(crate) fn sort_notes(notes: &mut [Note]) {
    notes.sort_by(compare_notes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sidecar_note(pod: &str, image: &str) -> Note {
        Note::new(
            NoteType::SidecarImageMismatch,
            "Mismatched sidecar image - ${pod_name}",
            "The pod ${pod_name} runs ${sidecar_image}",
            NoteLevel::Warning,
            attrs(&[
                ("pod_name", pod),
                ("namespace", "default"),
                ("sidecar_image", image),
                ("inject_sidecar_image", "proxy:1.0.0"),
            ]),
        )
    }

    #[test]
    fn test_stamp_is_deterministic() {
        let first = stamp(sidecar_note("a", "proxy:0.8.0"));
        let second = stamp(sidecar_note("a", "proxy:0.8.0"));
        assert_eq!(first.id, second.id);
        assert_eq!(first.id.len(), 64);
    }

    #[test]
    fn test_stamp_is_idempotent() {
        let once = stamp(sidecar_note("a", "proxy:0.8.0"));
        let twice = stamp(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_stamp_ignores_attribute_insertion_order() {
        let mut forward = Attributes::new();
        forward.insert("a".into(), "1".into());
        forward.insert("b".into(), "2".into());
        let mut backward = Attributes::new();
        backward.insert("b".into(), "2".into());
        backward.insert("a".into(), "1".into());

        let summary = "s";
        let message = "m";
        let note = |attributes| {
            stamp(Note::new(
                NoteType::MissingVersion,
                summary,
                message,
                NoteLevel::Info,
                attributes,
            ))
        };
        assert_eq!(note(forward).id, note(backward).id);
    }

    #[test]
    fn test_stamp_changes_with_content() {
        let a = stamp(sidecar_note("a", "proxy:0.8.0"));
        let b = stamp(sidecar_note("b", "proxy:0.8.0"));
        let c = stamp(sidecar_note("a", "proxy:0.9.0"));
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_stamp_only_touches_id() {
        let note = sidecar_note("a", "proxy:0.8.0");
        let stamped = stamp(note.clone());
        assert_eq!(stamped.note_type, note.note_type);
        assert_eq!(stamped.summary, note.summary);
        assert_eq!(stamped.message, note.message);
        assert_eq!(stamped.level, note.level);
        assert_eq!(stamped.attributes, note.attributes);
    }

    #[test]
    fn test_render_fills_placeholders() {
        let note = sidecar_note("web-1", "proxy:0.8.0");
        assert_eq!(note.rendered_summary(), "Mismatched sidecar image - web-1");
        assert_eq!(note.rendered_message(), "The pod web-1 runs proxy:0.8.0");
    }

    #[test]
    fn test_render_keeps_unknown_placeholders() {
        let rendered = render("${known} and ${unknown}", &attrs(&[("known", "x")]));
        assert_eq!(rendered, "x and ${unknown}");
    }

    #[test]
    fn test_serializes_wire_names() {
        let note = stamp(sidecar_note("a", "proxy:0.8.0"));
        let json = serde_json::to_value(&note).expect("note serializes");
        assert_eq!(json["type"], "sidecar-image-mismatch");
        assert_eq!(json["level"], "WARNING");
        assert_eq!(json["attr"]["pod_name"], "a");
        assert_eq!(json["msg"], "The pod ${pod_name} runs ${sidecar_image}");
    }

    #[test]
    fn test_note_type_names_match_serde() {
        for t in [
            NoteType::InitImageMismatch,
            NoteType::SidecarImageMismatch,
            NoteType::MissingVersion,
            NoteType::ComponentMismatch,
        ] {
            let json = serde_json::to_value(t).expect("type serializes");
            assert_eq!(json, t.as_str());
        }
    }

    #[test]
    fn test_compare_orders_by_namespace_pod_then_kind() {
        let mut init = sidecar_note("a", "proxy:0.8.0");
        init.note_type = NoteType::InitImageMismatch;
        let mut notes = vec![sidecar_note("b", "x"), sidecar_note("a", "x"), init];
        sort_notes(&mut notes);
        assert_eq!(notes[0].note_type, NoteType::InitImageMismatch);
        assert_eq!(notes[1].attr("pod_name"), Some("a"));
        assert_eq!(notes[1].note_type, NoteType::SidecarImageMismatch);
        assert_eq!(notes[2].attr("pod_name"), Some("b"));
    }
}
