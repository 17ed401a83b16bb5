use std::collections::HashMap;

/// Versions of local field writes that have not been echoed back yet.
///
/// An entry for a field means the locally visible value is authored here and
/// still in flight; remote values for that field are ignored until the echo
/// carrying the same version clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingWrites {
    versions: HashMap<String, u64>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local write. A later write replaces the earlier version.
    pub fn mark(&mut self, field: &str, version: u64) {
        self.versions.insert(field.to_string(), version);
    }

    /// Clear the entry if `version` is the one still in flight.
    ///
    /// Returns `true` when the entry was removed. An echo for an older
    /// version leaves the newer entry untouched.
    pub fn resolve(&mut self, field: &str, version: u64) -> bool {
        match self.versions.get(field) {
            Some(&pending) if pending == version => {
                self.versions.remove(field);
                true
            }
            _ => false,
        }
    }

    /// Move the entry from `from` to `to` if it still points at `from`.
    pub fn retarget(&mut self, field: &str, from: u64, to: u64) -> bool {
        match self.versions.get_mut(field) {
            Some(pending) if *pending == from => {
                *pending = to;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, field: &str) -> bool {
        self.versions.contains_key(field)
    }

    pub fn version(&self, field: &str) -> Option<u64> {
        self.versions.get(field).copied()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, u64)> {
        self.versions.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
