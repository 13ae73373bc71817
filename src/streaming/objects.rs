//! Objects attached to chunks and the registry that prepares their visuals

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::streaming::external::VisualHandle;

/// An object living inside a chunk
///
/// `payload` is opaque to the engine and persisted byte-for-byte. `visual` is
/// runtime-only and never serialized.
#[derive(Clone, Debug)]
pub struct AttachedObject {
    /// Stable id, unique within the owning region
    pub id: u64,
    /// Per-chunk address written into the object layer cells
    pub address: u16,
    /// Factory key used to prepare the visual
    pub kind: String,
    /// Serialized object state
    pub payload: Vec<u8>,
    /// Prepared visual, if any
    pub visual: Option<VisualHandle>,
}

impl AttachedObject {
    pub fn new(id: u64, kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id,
            address: 0,
            kind: kind.into(),
            payload,
            visual: None,
        }
    }

    /// Whether the visual has been prepared
    pub fn is_initialized(&self) -> bool {
        self.visual.is_some()
    }
}

impl PartialEq for AttachedObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.address == other.address
            && self.kind == other.kind
            && self.payload == other.payload
    }
}

impl Eq for AttachedObject {}

/// Prepares the presentation side of one kind of object.
///
/// Runs on worker threads.
pub trait ObjectFactory: Send + Sync {
    fn prepare(&self, object: &AttachedObject) -> Option<VisualHandle>;
}

impl<F> ObjectFactory for F
where
    F: Fn(&AttachedObject) -> Option<VisualHandle> + Send + Sync,
{
    fn prepare(&self, object: &AttachedObject) -> Option<VisualHandle> {
        self(object)
    }
}

/// Kind name -> factory lookup, passed explicitly into the volume
#[derive(Default)]
pub struct ObjectRegistry {
    factories: HashMap<String, Arc<dyn ObjectFactory>>,
    /// Kinds already reported as missing, so the warning fires once
    reported_missing: Mutex<HashSet<String>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `kind`
    pub fn register(&mut self, kind: impl Into<String>, factory: Arc<dyn ObjectFactory>) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Prepare a visual for `object`. Unknown kinds yield `None`.
    pub fn prepare(&self, object: &AttachedObject) -> Option<VisualHandle> {
        match self.factories.get(&object.kind) {
            Some(factory) => factory.prepare(object),
            None => {
                let mut reported = self
                    .reported_missing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if reported.insert(object.kind.clone()) {
                    log::warn!("No object factory registered for kind '{}'", object.kind);
                }
                None
            }
        }
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("ObjectRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}
