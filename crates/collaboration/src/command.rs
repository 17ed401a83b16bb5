/// Document commands: the unit of replication between sessions and rooms
use beatmap::{Annotation, AnnotationId, Document, Entity, EntityId, FieldValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{AccessLevel, CommandContext, Origin};

/// Wire discriminant of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandTag {
    CreateEntity = 1,
    DeleteEntity = 2,
    UpdateEntity = 3,
    CreateAnnotation = 4,
    RemoveAnnotation = 5,
}

impl CommandTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(CommandTag::CreateEntity),
            2 => Some(CommandTag::DeleteEntity),
            3 => Some(CommandTag::UpdateEntity),
            4 => Some(CommandTag::CreateAnnotation),
            5 => Some(CommandTag::RemoveAnnotation),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// An immutable description of one document mutation.
///
/// Applying the same command twice with the same context leaves the same
/// field values: every variant sets, none increments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Command {
    CreateEntity {
        entity: Entity,
    },
    DeleteEntity {
        id: EntityId,
    },
    UpdateEntity {
        id: EntityId,
        fields: BTreeMap<String, FieldValue>,
    },
    CreateAnnotation {
        annotation: Annotation,
    },
    RemoveAnnotation {
        id: AnnotationId,
    },
}

/// Observable effect of an applied command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    EntityCreated(EntityId),
    EntityDeleted(EntityId),
    FieldsChanged { id: EntityId, fields: Vec<String> },
    AnnotationCreated(AnnotationId),
    AnnotationRemoved(AnnotationId),
}

impl Command {
    pub fn create_entity(entity: Entity) -> Self {
        Command::CreateEntity {
            entity: entity.detached(),
        }
    }

    pub fn delete_entity(id: EntityId) -> Self {
        Command::DeleteEntity { id }
    }

    pub fn update_entity<K, V>(id: EntityId, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        Command::UpdateEntity {
            id,
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn create_annotation(annotation: Annotation) -> Self {
        Command::CreateAnnotation { annotation }
    }

    pub fn remove_annotation(id: AnnotationId) -> Self {
        Command::RemoveAnnotation { id }
    }

    pub fn tag(&self) -> CommandTag {
        match self {
            Command::CreateEntity { .. } => CommandTag::CreateEntity,
            Command::DeleteEntity { .. } => CommandTag::DeleteEntity,
            Command::UpdateEntity { .. } => CommandTag::UpdateEntity,
            Command::CreateAnnotation { .. } => CommandTag::CreateAnnotation,
            Command::RemoveAnnotation { .. } => CommandTag::RemoveAnnotation,
        }
    }

    /// Every command kind mutates the document.
    pub fn required_access(&self) -> AccessLevel {
        AccessLevel::Edit
    }

    /// Apply to the context's document. `None` means nothing observable
    /// changed (missing target, suppressed values, echo of an applied edit).
    pub fn apply(&self, ctx: &mut CommandContext<'_>) -> Option<Change> {
        match self {
            Command::CreateEntity { entity } => create_entity(ctx, entity),
            Command::DeleteEntity { id } => delete_entity(ctx, id),
            Command::UpdateEntity { id, fields } => update_entity(ctx, id, fields),
            Command::CreateAnnotation { annotation } => create_annotation(ctx, annotation),
            Command::RemoveAnnotation { id } => remove_annotation(ctx, id),
        }
    }

    /// Command restoring the state this command is about to overwrite.
    ///
    /// Must be called before `apply`. Returns `None` when there is nothing to
    /// restore, e.g. an update or delete targeting a missing entity.
    pub fn create_undo(&self, document: &Document) -> Option<Command> {
        match self {
            Command::CreateEntity { entity } => Some(match document.get(&entity.id) {
                Some(previous) => Command::CreateEntity {
                    entity: previous.detached(),
                },
                None => Command::DeleteEntity {
                    id: entity.id.clone(),
                },
            }),
            Command::DeleteEntity { id } => document.get(id).map(|entity| Command::CreateEntity {
                entity: entity.detached(),
            }),
            Command::UpdateEntity { id, fields } => {
                document.get(id).map(|entity| Command::UpdateEntity {
                    id: id.clone(),
                    fields: entity.capture(fields.keys()),
                })
            }
            Command::CreateAnnotation { annotation } => {
                Some(match document.annotation(&annotation.id) {
                    Some(previous) => Command::CreateAnnotation {
                        annotation: previous.clone(),
                    },
                    None => Command::RemoveAnnotation {
                        id: annotation.id.clone(),
                    },
                })
            }
            Command::RemoveAnnotation { id } => {
                document
                    .annotation(id)
                    .map(|annotation| Command::CreateAnnotation {
                        annotation: annotation.clone(),
                    })
            }
        }
    }

    /// Combine `self` followed by `next` into one equivalent command.
    ///
    /// Only updates of the same entity merge; `next` wins on shared fields.
    pub fn merge(&self, next: &Command) -> Option<Command> {
        match (self, next) {
            (
                Command::UpdateEntity { id, fields },
                Command::UpdateEntity {
                    id: next_id,
                    fields: next_fields,
                },
            ) if id == next_id => {
                let mut merged = fields.clone();
                for (name, value) in next_fields {
                    merged.insert(name.clone(), value.clone());
                }
                Some(Command::UpdateEntity {
                    id: id.clone(),
                    fields: merged,
                })
            }
            _ => None,
        }
    }

    /// True when applying this command could not change the document.
    pub fn can_be_ignored(&self, document: &Document) -> bool {
        match self {
            Command::CreateEntity { .. } | Command::CreateAnnotation { .. } => false,
            Command::DeleteEntity { id } => !document.contains(id),
            Command::UpdateEntity { id, fields } => match document.get(id) {
                Some(entity) => fields.iter().all(|(name, value)| match entity.field(name) {
                    Some(current) => current == value,
                    None => value.is_null(),
                }),
                None => true,
            },
            Command::RemoveAnnotation { id } => document.annotation(id).is_none(),
        }
    }

    /// Entity fields this command writes, used to retarget pending entries
    /// when buffered commands merge.
    pub fn written_fields(&self) -> Option<(&EntityId, impl Iterator<Item = &String>)> {
        match self {
            Command::UpdateEntity { id, fields } => Some((id, fields.keys())),
            _ => None,
        }
    }
}

fn create_entity(ctx: &mut CommandContext<'_>, entity: &Entity) -> Option<Change> {
    if ctx.origin == Origin::OwnEcho {
        return None;
    }

    let mut incoming = entity.detached();
    if ctx.origin == Origin::Remote {
        // Keep in-flight local values of a replaced entity
        if let Some(existing) = ctx.document.get(&entity.id) {
            for (field, _) in existing.pending().fields() {
                let value = existing.field(field).cloned().unwrap_or_default();
                incoming.set_field(field, value);
            }
            *incoming.pending_mut() = existing.pending().clone();
        }
    }

    let id = incoming.id.clone();
    ctx.document.add(incoming);
    Some(Change::EntityCreated(id))
}

fn delete_entity(ctx: &mut CommandContext<'_>, id: &EntityId) -> Option<Change> {
    if ctx.origin == Origin::OwnEcho {
        return None;
    }
    ctx.document
        .remove(id)
        .map(|entity| Change::EntityDeleted(entity.id))
}

fn update_entity(
    ctx: &mut CommandContext<'_>,
    id: &EntityId,
    fields: &BTreeMap<String, FieldValue>,
) -> Option<Change> {
    let version = ctx.version;
    let origin = ctx.origin;
    let entity = ctx.document.get_mut(id)?;

    let mut changed = Vec::new();
    match origin {
        Origin::Local => {
            for (name, value) in fields {
                entity.pending_mut().mark(name, version);
                entity.set_field(name, value.clone());
                changed.push(name.clone());
            }
        }
        Origin::OwnEcho => {
            for name in fields.keys() {
                entity.pending_mut().resolve(name, version);
            }
        }
        Origin::Remote => {
            for (name, value) in fields {
                if entity.pending().is_pending(name) {
                    tracing::trace!(entity = %id, field = %name, "remote value suppressed by pending write");
                    continue;
                }
                entity.set_field(name, value.clone());
                changed.push(name.clone());
            }
        }
    }

    if changed.is_empty() {
        None
    } else {
        Some(Change::FieldsChanged {
            id: id.clone(),
            fields: changed,
        })
    }
}

fn create_annotation(ctx: &mut CommandContext<'_>, annotation: &Annotation) -> Option<Change> {
    if ctx.origin == Origin::OwnEcho {
        return None;
    }
    if ctx.document.annotation(&annotation.id) == Some(annotation) {
        return None;
    }
    ctx.document.add_annotation(annotation.clone());
    Some(Change::AnnotationCreated(annotation.id.clone()))
}

fn remove_annotation(ctx: &mut CommandContext<'_>, id: &AnnotationId) -> Option<Change> {
    if ctx.origin == Origin::OwnEcho {
        return None;
    }
    ctx.document
        .remove_annotation(id)
        .map(|annotation| Change::AnnotationRemoved(annotation.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beatmap::{DocumentId, EntityKind};

    fn document_with_circle(x: i64) -> Document {
        let mut doc = Document::new(DocumentId::new());
        doc.add(Entity::new(EntityId::from("a"), EntityKind::HitCircle).with_field("x", x));
        doc
    }

    fn x_of(doc: &Document) -> Option<i64> {
        doc.get(&EntityId::from("a"))
            .and_then(|e| e.field("x"))
            .and_then(|v| v.as_int())
    }

    fn set_x(x: i64) -> Command {
        Command::update_entity(EntityId::from("a"), [("x", x)])
    }

    #[test]
    fn test_local_update_marks_pending() {
        let mut doc = document_with_circle(10);
        let change = set_x(20).apply(&mut CommandContext::local(&mut doc, 2));

        assert_eq!(
            change,
            Some(Change::FieldsChanged {
                id: EntityId::from("a"),
                fields: vec!["x".to_string()],
            })
        );
        assert_eq!(x_of(&doc), Some(20));
        let entity = doc.get(&EntityId::from("a")).unwrap();
        assert_eq!(entity.pending().version("x"), Some(2));
    }

    #[test]
    fn test_remote_update_suppressed_while_pending() {
        let mut doc = document_with_circle(10);
        set_x(20).apply(&mut CommandContext::local(&mut doc, 2));

        let change = set_x(30).apply(&mut CommandContext::remote(&mut doc, 1));
        assert_eq!(change, None);
        assert_eq!(x_of(&doc), Some(20));
    }

    #[test]
    fn test_echo_clears_pending_without_reapplying() {
        let mut doc = document_with_circle(10);
        set_x(20).apply(&mut CommandContext::local(&mut doc, 2));
        // The echo carries a value the room may since have overwritten; it
        // must never be written back.
        let change = set_x(99).apply(&mut CommandContext::own_echo(&mut doc, 2));

        assert_eq!(change, None);
        assert_eq!(x_of(&doc), Some(20));
        assert!(doc.get(&EntityId::from("a")).unwrap().pending().is_empty());

        set_x(30).apply(&mut CommandContext::remote(&mut doc, 1));
        assert_eq!(x_of(&doc), Some(30));
    }

    #[test]
    fn test_stale_echo_keeps_newer_pending() {
        let mut doc = document_with_circle(10);
        set_x(20).apply(&mut CommandContext::local(&mut doc, 2));
        set_x(25).apply(&mut CommandContext::local(&mut doc, 3));

        set_x(20).apply(&mut CommandContext::own_echo(&mut doc, 2));
        let entity = doc.get(&EntityId::from("a")).unwrap();
        assert_eq!(entity.pending().version("x"), Some(3));
        assert_eq!(x_of(&doc), Some(25));
    }

    #[test]
    fn test_update_missing_entity_is_noop() {
        let mut doc = Document::default();
        let cmd = Command::update_entity(EntityId::from("ghost"), [("x", 1i64)]);
        assert_eq!(cmd.apply(&mut CommandContext::remote(&mut doc, 1)), None);
        assert!(cmd.create_undo(&doc).is_none());
        assert!(cmd.can_be_ignored(&doc));
    }

    #[test]
    fn test_update_undo_captures_previous_values() {
        let doc = document_with_circle(10);
        let cmd = Command::update_entity(EntityId::from("a"), [("x", 20i64), ("y", 5i64)]);
        let undo = cmd.create_undo(&doc).unwrap();

        let mut expected = BTreeMap::new();
        expected.insert("x".to_string(), FieldValue::Int(10));
        expected.insert("y".to_string(), FieldValue::Null);
        assert_eq!(
            undo,
            Command::UpdateEntity {
                id: EntityId::from("a"),
                fields: expected,
            }
        );
    }

    #[test]
    fn test_undo_restores_unset_field() {
        let mut doc = document_with_circle(10);
        let cmd = Command::update_entity(EntityId::from("a"), [("y", 5i64)]);
        let undo = cmd.create_undo(&doc).unwrap();
        cmd.apply(&mut CommandContext::local(&mut doc, 1));
        undo.apply(&mut CommandContext::local(&mut doc, 2));
        assert!(doc.get(&EntityId::from("a")).unwrap().field("y").is_none());
    }

    #[test]
    fn test_merge_same_entity() {
        let merged = set_x(1).merge(&set_x(2)).unwrap();
        assert_eq!(merged, set_x(2));

        let a = Command::update_entity(EntityId::from("a"), [("x", 1i64)]);
        let b = Command::update_entity(EntityId::from("a"), [("y", 2i64)]);
        let merged = a.merge(&b).unwrap();
        match merged {
            Command::UpdateEntity { fields, .. } => assert_eq!(fields.len(), 2),
            other => panic!("unexpected merge result: {:?}", other),
        }
    }

    #[test]
    fn test_merge_rejects_different_targets() {
        let other = Command::update_entity(EntityId::from("b"), [("x", 2i64)]);
        assert!(set_x(1).merge(&other).is_none());
        assert!(set_x(1)
            .merge(&Command::delete_entity(EntityId::from("a")))
            .is_none());
    }

    #[test]
    fn test_create_and_delete_skip_own_echo() {
        let mut doc = Document::default();
        let entity = Entity::new(EntityId::from("a"), EntityKind::Slider);
        let create = Command::create_entity(entity);

        assert_eq!(create.apply(&mut CommandContext::own_echo(&mut doc, 1)), None);
        assert!(doc.is_empty());

        create.apply(&mut CommandContext::remote(&mut doc, 1));
        assert!(doc.contains(&EntityId::from("a")));

        let delete = Command::delete_entity(EntityId::from("a"));
        assert_eq!(delete.apply(&mut CommandContext::own_echo(&mut doc, 2)), None);
        assert!(doc.contains(&EntityId::from("a")));
        assert_eq!(
            delete.apply(&mut CommandContext::remote(&mut doc, 2)),
            Some(Change::EntityDeleted(EntityId::from("a")))
        );
        assert_eq!(delete.apply(&mut CommandContext::remote(&mut doc, 3)), None);
    }

    #[test]
    fn test_delete_undo_recreates_entity() {
        let mut doc = document_with_circle(10);
        let delete = Command::delete_entity(EntityId::from("a"));
        let undo = delete.create_undo(&doc).unwrap();
        delete.apply(&mut CommandContext::local(&mut doc, 1));
        assert!(!doc.contains(&EntityId::from("a")));

        undo.apply(&mut CommandContext::local(&mut doc, 2));
        assert_eq!(x_of(&doc), Some(10));
    }

    #[test]
    fn test_remote_create_keeps_pending_fields() {
        let mut doc = document_with_circle(10);
        set_x(20).apply(&mut CommandContext::local(&mut doc, 1));

        let replacement = Entity::new(EntityId::from("a"), EntityKind::HitCircle)
            .with_field("x", 50i64)
            .with_field("y", 7i64);
        Command::create_entity(replacement).apply(&mut CommandContext::remote(&mut doc, 4));

        let entity = doc.get(&EntityId::from("a")).unwrap();
        assert_eq!(entity.field("x"), Some(&FieldValue::Int(20)));
        assert_eq!(entity.field("y"), Some(&FieldValue::Int(7)));
        assert_eq!(entity.pending().version("x"), Some(1));
    }

    #[test]
    fn test_annotation_round_trip() {
        let mut doc = Document::default();
        let annotation = Annotation::new(1500, "kiai start");
        let create = Command::create_annotation(annotation.clone());
        let undo = create.create_undo(&doc).unwrap();
        assert_eq!(undo, Command::remove_annotation(annotation.id.clone()));

        assert!(create.apply(&mut CommandContext::local(&mut doc, 1)).is_some());
        assert_eq!(create.apply(&mut CommandContext::remote(&mut doc, 1)), None);
        assert!(undo.apply(&mut CommandContext::local(&mut doc, 2)).is_some());
        assert!(doc.annotation(&annotation.id).is_none());
        assert!(undo.can_be_ignored(&doc));
    }

    #[test]
    fn test_no_op_update_can_be_ignored() {
        let doc = document_with_circle(10);
        assert!(set_x(10).can_be_ignored(&doc));
        assert!(!set_x(11).can_be_ignored(&doc));
        let clear_missing = Command::update_entity(EntityId::from("a"), [("y", FieldValue::Null)]);
        assert!(clear_missing.can_be_ignored(&doc));
    }
}
