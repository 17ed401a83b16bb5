/// Binary batch codec for commands on the wire.
///
/// A batch is an ordered list of `(version, tag, payload)` entries. Payloads
/// are decoded per entry so an unknown tag or a corrupt payload only costs
/// that entry, never the batch.
use beatmap::{Entity, EntityId, FieldValue};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Command, CommandTag, CollaborationError, Result};

/// A command stamped with its author's version
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedCommand {
    pub version: u64,
    pub command: Command,
}

impl VersionedCommand {
    pub fn new(version: u64, command: Command) -> Self {
        Self { version, command }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCommand {
    version: u64,
    tag: u8,
    payload: Vec<u8>,
}

fn options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new().with_limit(limit)
}

pub(crate) fn to_bytes<T: Serialize>(value: &T, limit: u64) -> Result<Vec<u8>> {
    options(limit)
        .serialize(value)
        .map_err(|e| CollaborationError::Codec(e.to_string()))
}

pub(crate) fn from_bytes<T: DeserializeOwned>(bytes: &[u8], limit: u64) -> Result<T> {
    options(limit)
        .deserialize(bytes)
        .map_err(|e| CollaborationError::Codec(e.to_string()))
}

fn encode_payload(command: &Command, limit: u64) -> Result<Vec<u8>> {
    match command {
        Command::CreateEntity { entity } => to_bytes(entity, limit),
        Command::DeleteEntity { id } => to_bytes(id, limit),
        Command::UpdateEntity { id, fields } => to_bytes(&(id, fields), limit),
        Command::CreateAnnotation { annotation } => to_bytes(annotation, limit),
        Command::RemoveAnnotation { id } => to_bytes(id, limit),
    }
}

/// Snapshots are JSON, so a NaN or infinity accepted here could never be
/// read back.
fn ensure_finite<'a>(values: impl IntoIterator<Item = &'a FieldValue>) -> Result<()> {
    if values.into_iter().all(FieldValue::is_finite) {
        Ok(())
    } else {
        Err(CollaborationError::Codec(
            "non-finite float in field value".to_string(),
        ))
    }
}

fn decode_payload(tag: u8, payload: &[u8], limit: u64) -> Result<Command> {
    let tag = CommandTag::from_u8(tag).ok_or(CollaborationError::UnknownCommandTag(tag))?;
    let command = match tag {
        CommandTag::CreateEntity => {
            let entity: Entity = from_bytes(payload, limit)?;
            ensure_finite(entity.fields().values())?;
            Command::CreateEntity { entity }
        }
        CommandTag::DeleteEntity => Command::DeleteEntity {
            id: from_bytes(payload, limit)?,
        },
        CommandTag::UpdateEntity => {
            let (id, fields): (EntityId, BTreeMap<String, FieldValue>) =
                from_bytes(payload, limit)?;
            ensure_finite(fields.values())?;
            Command::UpdateEntity { id, fields }
        }
        CommandTag::CreateAnnotation => Command::CreateAnnotation {
            annotation: from_bytes(payload, limit)?,
        },
        CommandTag::RemoveAnnotation => Command::RemoveAnnotation {
            id: from_bytes(payload, limit)?,
        },
    };
    Ok(command)
}

/// Encode an ordered batch. Fails only if the batch exceeds `limit` bytes.
pub fn encode_batch(commands: &[VersionedCommand], limit: u64) -> Result<Vec<u8>> {
    let wire = commands
        .iter()
        .map(|vc| {
            Ok(WireCommand {
                version: vc.version,
                tag: vc.command.tag().as_u8(),
                payload: encode_payload(&vc.command, limit)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    to_bytes(&wire, limit)
}

/// Decode a batch, keeping arrival order.
///
/// A malformed envelope fails the whole batch; entries with unknown tags or
/// undecodable payloads are skipped with a warning.
pub fn decode_batch(bytes: &[u8], limit: u64) -> Result<Vec<VersionedCommand>> {
    let wire: Vec<WireCommand> = from_bytes(bytes, limit)?;
    let mut commands = Vec::with_capacity(wire.len());
    for entry in wire {
        match decode_payload(entry.tag, &entry.payload, limit) {
            Ok(command) => commands.push(VersionedCommand::new(entry.version, command)),
            Err(e) => {
                tracing::warn!(
                    tag = entry.tag,
                    version = entry.version,
                    "dropping undecodable command: {}",
                    e
                );
            }
        }
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beatmap::{Annotation, EntityKind};

    const LIMIT: u64 = 1024 * 1024;

    fn sample_batch() -> Vec<VersionedCommand> {
        let entity = Entity::new(EntityId::from("a"), EntityKind::HitCircle)
            .with_field("x", 10i64)
            .with_field("hitsound", "clap")
            .with_field("curve", vec![1.5f64, 2.5]);
        vec![
            VersionedCommand::new(1, Command::create_entity(entity)),
            VersionedCommand::new(
                2,
                Command::update_entity(EntityId::from("a"), [("x", 20i64)]),
            ),
            VersionedCommand::new(3, Command::create_annotation(Annotation::new(200, "drop"))),
            VersionedCommand::new(4, Command::delete_entity(EntityId::from("a"))),
        ]
    }

    #[test]
    fn test_batch_preserves_order_and_content() {
        let batch = sample_batch();
        let bytes = encode_batch(&batch, LIMIT).unwrap();
        let decoded = decode_batch(&bytes, LIMIT).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_unknown_tag_skips_entry_only() {
        let mut wire = vec![WireCommand {
            version: 7,
            tag: 200,
            payload: vec![1, 2, 3],
        }];
        wire.push(WireCommand {
            version: 8,
            tag: CommandTag::DeleteEntity.as_u8(),
            payload: to_bytes(&EntityId::from("a"), LIMIT).unwrap(),
        });
        let bytes = to_bytes(&wire, LIMIT).unwrap();

        let decoded = decode_batch(&bytes, LIMIT).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].version, 8);
    }

    #[test]
    fn test_corrupt_payload_skips_entry_only() {
        let wire = vec![
            WireCommand {
                version: 1,
                tag: CommandTag::CreateEntity.as_u8(),
                payload: vec![0xff; 3],
            },
            WireCommand {
                version: 2,
                tag: CommandTag::RemoveAnnotation.as_u8(),
                payload: to_bytes(&beatmap::AnnotationId::from("m"), LIMIT).unwrap(),
            },
        ];
        let bytes = to_bytes(&wire, LIMIT).unwrap();
        let decoded = decode_batch(&bytes, LIMIT).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].version, 2);
    }

    #[test]
    fn test_non_finite_floats_dropped_at_decode() {
        let nan_create = Entity::new(EntityId::from("a"), EntityKind::Slider)
            .with_field("sv", f64::NAN);
        let batch = vec![
            VersionedCommand::new(1, Command::create_entity(nan_create)),
            VersionedCommand::new(
                2,
                Command::update_entity(EntityId::from("b"), [("curve", vec![1.0f64, f64::INFINITY])]),
            ),
            VersionedCommand::new(3, Command::update_entity(EntityId::from("b"), [("sv", 1.25f64)])),
        ];
        let bytes = encode_batch(&batch, LIMIT).unwrap();
        let decoded = decode_batch(&bytes, LIMIT).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].version, 3);
    }

    #[test]
    fn test_malformed_envelope_fails_batch() {
        assert!(decode_batch(&[0xff, 0xff, 0xff], LIMIT).is_err());
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let batch = sample_batch();
        assert!(encode_batch(&batch, 16).is_err());
        let bytes = encode_batch(&batch, LIMIT).unwrap();
        assert!(decode_batch(&bytes, 16).is_err());
    }
}
