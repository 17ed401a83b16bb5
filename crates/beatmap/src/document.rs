use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

use crate::{BeatmapError, FieldValue, Millis, PendingWrites, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AnnotationId(pub String);

impl AnnotationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for AnnotationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for AnnotationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for AnnotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    HitCircle,
    Slider,
    Spinner,
    TimingPoint,
}

/// A timed object in the map.
///
/// Fields are free-form; the sync layer only relies on the stable id and the
/// pending-write map, which is local bookkeeping and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(default)]
    fields: BTreeMap<String, FieldValue>,
    #[serde(skip)]
    pending: PendingWrites,
}

impl Entity {
    pub fn new(id: EntityId, kind: EntityKind) -> Self {
        Self {
            id,
            kind,
            fields: BTreeMap::new(),
            pending: PendingWrites::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set_field(name, value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Write a field and return the previous value. Writing `Null` removes it.
    pub fn set_field(&mut self, name: &str, value: FieldValue) -> Option<FieldValue> {
        if value.is_null() {
            self.fields.remove(name)
        } else {
            self.fields.insert(name.to_string(), value)
        }
    }

    /// Current values of the named fields, `Null` for fields that are unset.
    pub fn capture<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> BTreeMap<String, FieldValue> {
        names
            .into_iter()
            .map(|name| {
                let value = self.fields.get(name).cloned().unwrap_or_default();
                (name.clone(), value)
            })
            .collect()
    }

    pub fn pending(&self) -> &PendingWrites {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingWrites {
        &mut self.pending
    }

    /// Copy of this entity without local pending state, as sent on the wire.
    pub fn detached(&self) -> Entity {
        Entity {
            id: self.id.clone(),
            kind: self.kind,
            fields: self.fields.clone(),
            pending: PendingWrites::new(),
        }
    }
}

/// A marker on the map's time axis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub id: AnnotationId,
    pub time: Millis,
    pub label: String,
}

impl Annotation {
    pub fn new(time: Millis, label: impl Into<String>) -> Self {
        Self {
            id: AnnotationId::new(),
            time,
            label: label.into(),
        }
    }
}

/// Aggregate root owning every entity and annotation of one shared map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    #[serde(default)]
    entities: BTreeMap<EntityId, Entity>,
    #[serde(default)]
    annotations: BTreeMap<AnnotationId, Annotation>,
}

impl Document {
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            entities: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Insert an entity, returning the one it replaced.
    pub fn add(&mut self, entity: Entity) -> Option<Entity> {
        self.entities.insert(entity.id.clone(), entity)
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        self.entities.remove(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn annotation_count(&self) -> usize {
        self.annotations.len()
    }

    /// No entities and no annotations
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.annotations.is_empty()
    }

    pub fn annotation(&self, id: &AnnotationId) -> Option<&Annotation> {
        self.annotations.get(id)
    }

    pub fn add_annotation(&mut self, annotation: Annotation) -> Option<Annotation> {
        self.annotations.insert(annotation.id.clone(), annotation)
    }

    pub fn remove_annotation(&mut self, id: &AnnotationId) -> Option<Annotation> {
        self.annotations.remove(id)
    }

    /// Annotations ordered by time.
    pub fn annotations(&self) -> Vec<&Annotation> {
        let mut annotations: Vec<_> = self.annotations.values().collect();
        annotations.sort_by_key(|a| a.time);
        annotations
    }

    pub fn to_snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BeatmapError::SnapshotEncode(e.to_string()))
    }

    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| BeatmapError::SnapshotDecode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle(id: &str, x: i64) -> Entity {
        Entity::new(EntityId::from(id), EntityKind::HitCircle)
            .with_field("x", x)
            .with_field("time", 1200i64)
    }

    #[test]
    fn test_set_null_removes_field() {
        let mut entity = circle("a", 10);
        let previous = entity.set_field("x", FieldValue::Null);
        assert_eq!(previous, Some(FieldValue::Int(10)));
        assert!(entity.field("x").is_none());
    }

    #[test]
    fn test_capture_reports_missing_as_null() {
        let entity = circle("a", 10);
        let names = vec!["x".to_string(), "y".to_string()];
        let captured = entity.capture(&names);
        assert_eq!(captured["x"], FieldValue::Int(10));
        assert_eq!(captured["y"], FieldValue::Null);
    }

    #[test]
    fn test_snapshot_skips_pending_state() {
        let mut doc = Document::new(DocumentId::new());
        let mut entity = circle("a", 10);
        entity.pending_mut().mark("x", 7);
        doc.add(entity);
        doc.add_annotation(Annotation::new(500, "kiai"));

        let bytes = doc.to_snapshot().unwrap();
        let restored = Document::from_snapshot(&bytes).unwrap();

        let entity = restored.get(&EntityId::from("a")).unwrap();
        assert_eq!(entity.field("x"), Some(&FieldValue::Int(10)));
        assert!(entity.pending().is_empty());
        assert_eq!(restored.annotations().len(), 1);
        assert_eq!(restored.id, doc.id);
    }

    #[test]
    fn test_from_snapshot_rejects_garbage() {
        assert!(Document::from_snapshot(b"not json").is_err());
    }

    #[test]
    fn test_annotations_sorted_by_time() {
        let mut doc = Document::default();
        doc.add_annotation(Annotation::new(900, "b"));
        doc.add_annotation(Annotation::new(100, "a"));
        let labels: Vec<_> = doc.annotations().iter().map(|a| a.label.clone()).collect();
        assert_eq!(labels, vec!["a", "b"]);
    }

    #[test]
    fn test_counts_agree_with_is_empty() {
        let mut doc = Document::default();
        doc.add_annotation(Annotation::new(100, "a"));
        assert_eq!(doc.entity_count(), 0);
        assert_eq!(doc.annotation_count(), 1);
        assert!(!doc.is_empty());

        doc.add(circle("a", 10));
        assert_eq!(doc.entity_count(), 1);
    }
}
