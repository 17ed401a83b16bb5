use beatmap::Document;
use serde::{Deserialize, Serialize};

/// Where a command being applied came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Authored here, applied optimistically
    Local,
    /// Authored here, returned by the authority
    OwnEcho,
    /// Authored by another session (or applied by the authority itself)
    Remote,
}

/// Everything a command needs to apply itself
#[derive(Debug)]
pub struct CommandContext<'a> {
    pub document: &'a mut Document,
    pub origin: Origin,
    pub version: u64,
}

impl<'a> CommandContext<'a> {
    pub fn new(document: &'a mut Document, origin: Origin, version: u64) -> Self {
        Self {
            document,
            origin,
            version,
        }
    }

    pub fn local(document: &'a mut Document, version: u64) -> Self {
        Self::new(document, Origin::Local, version)
    }

    pub fn own_echo(document: &'a mut Document, version: u64) -> Self {
        Self::new(document, Origin::OwnEcho, version)
    }

    pub fn remote(document: &'a mut Document, version: u64) -> Self {
        Self::new(document, Origin::Remote, version)
    }
}
