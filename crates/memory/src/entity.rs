//! The entity graph: named world objects and characters, merged field-by-field
//! as the story reveals more about them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A persistent world object or character.
///
/// `info` and `secret` accumulate over the story; the remaining fields hold
/// the latest known value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub brief: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub appearance: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub clothes: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub info: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "entity".to_string(),
            ..Self::default()
        }
    }

    /// Text that participates in semantic search for this entity.
    pub fn searchable_text(&self) -> String {
        let mut text = self.info.clone();
        if !self.secret.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&self.secret);
        }
        text
    }

    /// Full record rendered for prompt injection.
    pub fn to_prompt_text(&self) -> String {
        let mut lines = vec![format!("id: {}", self.id), format!("type: {}", self.kind)];
        for (label, value) in [
            ("name", &self.name),
            ("brief", &self.brief),
            ("appearance", &self.appearance),
            ("clothes", &self.clothes),
            ("info", &self.info),
            ("secret", &self.secret),
            ("state", &self.state),
        ] {
            if !value.is_empty() {
                lines.push(format!("{label}: {value}"));
            }
        }
        lines.join("\n")
    }
}

/// A partial entity as produced by the model: only the provided fields are
/// merged into the stored record.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EntityUpdate {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub brief: Option<String>,
    pub appearance: Option<String>,
    pub clothes: Option<String>,
    pub info: Option<String>,
    pub secret: Option<String>,
    pub state: Option<String>,
}

/// Batch of entity merges keyed by entity id.
pub type MemoryGraphUpdate = BTreeMap<String, EntityUpdate>;

/// Map of entity id → entity.  Updating an unknown id creates it with empty
/// defaults before merging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryGraph {
    pub entities: BTreeMap<String, Entity>,
}

impl MemoryGraph {
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entities.keys()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Merge one update into the graph and return the resulting record.
    ///
    /// Merge rule (applied uniformly): `info` and `secret` append on a new
    /// line after the existing text; every other provided field overwrites.
    /// Absent fields never touch stored values.
    pub fn apply(&mut self, id: &str, update: &EntityUpdate) -> &Entity {
        let entity = self
            .entities
            .entry(id.to_string())
            .or_insert_with(|| Entity::new(id));
        if let Some(kind) = &update.kind {
            entity.kind = kind.clone();
        }
        if let Some(name) = &update.name {
            entity.name = name.clone();
        }
        if let Some(brief) = &update.brief {
            entity.brief = brief.clone();
        }
        if let Some(appearance) = &update.appearance {
            entity.appearance = appearance.clone();
        }
        if let Some(clothes) = &update.clothes {
            entity.clothes = clothes.clone();
        }
        if let Some(info) = &update.info {
            append_line(&mut entity.info, info);
        }
        if let Some(secret) = &update.secret {
            append_line(&mut entity.secret, secret);
        }
        if let Some(state) = &update.state {
            entity.state = state.clone();
        }
        entity
    }

    /// Insert a complete entity, replacing any previous record with that id.
    pub fn insert(&mut self, entity: Entity) {
        self.entities.insert(entity.id.clone(), entity);
    }
}

fn append_line(target: &mut String, addition: &str) {
    if addition.is_empty() {
        return;
    }
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(addition);
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn update(info: Option<&str>, name: Option<&str>) -> EntityUpdate {
        EntityUpdate {
            info: info.map(String::from),
            name: name.map(String::from),
            ..EntityUpdate::default()
        }
    }

    #[test]
    fn apply_to_unknown_id_creates_entity_with_defaults() {
        let mut graph = MemoryGraph::default();
        graph.apply("goblin", &update(Some("lives in a cave"), Some("Grix")));
        let entity = graph.get("goblin").unwrap();
        assert_eq!(entity.id, "goblin");
        assert_eq!(entity.kind, "entity");
        assert_eq!(entity.name, "Grix");
        assert_eq!(entity.info, "lives in a cave");
    }

    #[test]
    fn info_and_secret_are_append_only() {
        let mut graph = MemoryGraph::default();
        graph.apply("e1", &update(Some("first fact"), None));
        graph.apply("e1", &update(Some("second fact"), None));
        graph.apply(
            "e1",
            &EntityUpdate {
                secret: Some("hidden".to_string()),
                ..EntityUpdate::default()
            },
        );
        graph.apply(
            "e1",
            &EntityUpdate {
                secret: Some("deeper".to_string()),
                ..EntityUpdate::default()
            },
        );
        let entity = graph.get("e1").unwrap();
        assert_eq!(entity.info, "first fact\nsecond fact");
        assert_eq!(entity.secret, "hidden\ndeeper");
    }

    #[test]
    fn absent_fields_never_clear_stored_values() {
        let mut graph = MemoryGraph::default();
        graph.apply(
            "e1",
            &EntityUpdate {
                name: Some("Ava".to_string()),
                state: Some("wounded".to_string()),
                ..EntityUpdate::default()
            },
        );
        graph.apply("e1", &update(Some("a fact"), None));
        let entity = graph.get("e1").unwrap();
        assert_eq!(entity.name, "Ava");
        assert_eq!(entity.state, "wounded");
    }

    #[test]
    fn provided_fields_overwrite() {
        let mut graph = MemoryGraph::default();
        graph.apply("e1", &update(None, Some("Old Name")));
        graph.apply("e1", &update(None, Some("New Name")));
        assert_eq!(graph.get("e1").unwrap().name, "New Name");
    }

    #[test]
    fn searchable_text_joins_info_and_secret() {
        let entity = Entity {
            info: "public".to_string(),
            secret: "private".to_string(),
            ..Entity::new("e")
        };
        assert_eq!(entity.searchable_text(), "public\nprivate");
        let bare = Entity::new("e");
        assert_eq!(bare.searchable_text(), "");
    }

    #[test]
    fn prompt_text_skips_empty_fields() {
        let entity = Entity {
            name: "Grix".to_string(),
            info: "a goblin".to_string(),
            ..Entity::new("goblin")
        };
        let text = entity.to_prompt_text();
        assert!(text.contains("id: goblin"));
        assert!(text.contains("name: Grix"));
        assert!(!text.contains("secret:"));
        assert!(!text.contains("clothes:"));
    }
}
