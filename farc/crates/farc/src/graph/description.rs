//! JSON graph descriptions
//!
//! Objects are named by string ids instead of addresses; addresses are
//! assigned when the description is turned into a [`MemoryGraph`].
//!
//! ```json
//! {
//!   "metadata": [
//!     { "id": "name", "kind": "Symbol", "text": "java/lang/Object" },
//!     { "id": "obj", "kind": "InstanceClass", "name": "java/lang/Object",
//!       "size": 32, "fields": [{ "offset": 8, "target": "name" }] }
//!   ],
//!   "heap": [{ "id": "cache", "class": "obj", "size": 16, "hash": 7 }],
//!   "static_roots": [{ "holder": "obj", "field": "CACHE", "offset": 24, "value": "cache" }]
//! }
//! ```

use super::{MemoryGraph, MetaKind};
use crate::address::SourceAddr;
use crate::error::{ArchiveError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pointer field: `offset` holds a reference to the object named `target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub offset: usize,
    pub target: String,
}

/// Plain data word
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordDescription {
    pub offset: usize,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDescription {
    pub id: String,
    pub kind: MetaKind,
    /// Symbol text (symbols only)
    #[serde(default)]
    pub text: Option<String>,
    /// Class name (classes only)
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub fields: Vec<FieldDescription>,
    #[serde(default)]
    pub words: Vec<WordDescription>,
    /// Symbol sort key; defaults to position among symbols
    #[serde(default)]
    pub sort_key: Option<u64>,
    #[serde(default)]
    pub unrepresentable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapObjectDescription {
    pub id: String,
    /// Id of the object's class in `metadata`
    pub class: String,
    pub size: usize,
    #[serde(default)]
    pub hash: u32,
    #[serde(default)]
    pub refs: Vec<FieldDescription>,
    #[serde(default)]
    pub loader_wiring: Vec<FieldDescription>,
    #[serde(default)]
    pub words: Vec<WordDescription>,
    #[serde(default = "default_true")]
    pub archivable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRootDescription {
    pub holder: String,
    pub field: String,
    pub offset: u32,
    /// Heap object id, or absent for a null field
    #[serde(default)]
    pub value: Option<String>,
}

/// Complete serialisable description of a live graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDescription {
    /// First synthetic address to hand out
    #[serde(default)]
    pub base: Option<u64>,
    #[serde(default)]
    pub metadata: Vec<MetadataDescription>,
    #[serde(default)]
    pub heap: Vec<HeapObjectDescription>,
    #[serde(default)]
    pub static_roots: Vec<StaticRootDescription>,
    #[serde(default)]
    pub interned_strings: Vec<String>,
    #[serde(default)]
    pub extra_roots: Vec<String>,
}

impl GraphDescription {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ArchiveError::InvalidArgument(format!("graph description: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ArchiveError::Internal(format!("graph description: {e}")))
    }

    /// Materialize the description
    ///
    /// Objects are created in listing order, then fields are filled in, so
    /// forward references and cycles are allowed.
    pub fn build(&self) -> Result<MemoryGraph> {
        let mut graph = match self.base {
            Some(base) => MemoryGraph::with_base(base),
            None => MemoryGraph::new(),
        };
        let mut ids: IndexMap<&str, SourceAddr> = IndexMap::new();
        let mut heap_ids: IndexMap<&str, SourceAddr> = IndexMap::new();

        for (position, meta) in self.metadata.iter().enumerate() {
            let addr = match meta.kind {
                MetaKind::Symbol => {
                    let text = meta.text.as_deref().unwrap_or_default();
                    let key = meta.sort_key.unwrap_or(position as u64);
                    graph.add_symbol_with_key(text, key)
                },
                kind if kind.is_class() => {
                    let name = meta.name.as_deref().ok_or_else(|| {
                        ArchiveError::InvalidArgument(format!("class '{}' has no name", meta.id))
                    })?;
                    graph.add_class(kind, name, meta.size)?
                },
                kind => graph.add_metadata(kind, meta.size)?,
            };
            if ids.insert(meta.id.as_str(), addr).is_some() {
                return Err(duplicate(&meta.id));
            }
            if meta.unrepresentable {
                graph.mark_unrepresentable(addr)?;
            }
        }

        for object in &self.heap {
            let class = lookup(&ids, &object.class)?;
            let addr = graph.add_heap_object(class, object.size, object.hash);
            if heap_ids.insert(object.id.as_str(), addr).is_some() {
                return Err(duplicate(&object.id));
            }
            if !object.archivable {
                graph.mark_unarchivable(addr)?;
            }
        }

        for meta in &self.metadata {
            let addr = lookup(&ids, &meta.id)?;
            for word in &meta.words {
                graph.set_word(addr, word.offset, word.value)?;
            }
            for field in &meta.fields {
                let target = lookup_any(&ids, &heap_ids, &field.target)?;
                graph.set_pointer(addr, field.offset, target)?;
            }
        }

        for object in &self.heap {
            let addr = lookup(&heap_ids, &object.id)?;
            for word in &object.words {
                graph.set_heap_word(addr, word.offset, word.value)?;
            }
            for field in &object.refs {
                graph.set_heap_ref(addr, field.offset, lookup(&heap_ids, &field.target)?)?;
            }
            for field in &object.loader_wiring {
                let target = lookup_any(&heap_ids, &ids, &field.target)?;
                graph.set_loader_wiring(addr, field.offset, target)?;
            }
        }

        for root in &self.static_roots {
            let holder = lookup(&ids, &root.holder)?;
            let value = match &root.value {
                Some(id) => lookup(&heap_ids, id)?,
                None => SourceAddr::NULL,
            };
            graph.add_static_root(holder, &root.field, root.offset, value);
        }
        for id in &self.interned_strings {
            graph.add_interned_string(lookup(&heap_ids, id)?);
        }
        for id in &self.extra_roots {
            graph.add_extra_root(lookup(&ids, id)?);
        }

        Ok(graph)
    }
}

fn duplicate(id: &str) -> ArchiveError {
    ArchiveError::InvalidArgument(format!("duplicate object id '{id}'"))
}

fn lookup(ids: &IndexMap<&str, SourceAddr>, id: &str) -> Result<SourceAddr> {
    // "null" is always the null reference
    if id == "null" {
        return Ok(SourceAddr::NULL);
    }
    ids.get(id)
        .copied()
        .ok_or_else(|| ArchiveError::InvalidArgument(format!("unknown object id '{id}'")))
}

fn lookup_any(
    first: &IndexMap<&str, SourceAddr>,
    second: &IndexMap<&str, SourceAddr>,
    id: &str,
) -> Result<SourceAddr> {
    lookup(first, id).or_else(|_| lookup(second, id))
}

impl MemoryGraph {
    /// Parse a JSON [`GraphDescription`] and materialize it
    pub fn from_json(text: &str) -> Result<Self> {
        GraphDescription::from_json(text)?.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{HeapGraph, SourceGraph};

    const SAMPLE: &str = r#"{
        "metadata": [
            { "id": "name", "kind": "Symbol", "text": "Holder" },
            { "id": "holder", "kind": "InstanceClass", "name": "Holder", "size": 32,
              "fields": [{ "offset": 8, "target": "name" }],
              "words": [{ "offset": 16, "value": 42 }] }
        ],
        "heap": [
            { "id": "a", "class": "holder", "size": 16, "hash": 9,
              "refs": [{ "offset": 0, "target": "b" }] },
            { "id": "b", "class": "holder", "size": 8, "refs": [{ "offset": 0, "target": "a" }] }
        ],
        "static_roots": [
            { "holder": "holder", "field": "CACHE", "offset": 24, "value": "a" },
            { "holder": "holder", "field": "EMPTY", "offset": 32 }
        ]
    }"#;

    #[test]
    fn test_sample_builds_with_cycles() {
        let graph = MemoryGraph::from_json(SAMPLE).unwrap();
        let classes = graph.class_roots();
        assert_eq!(classes.len(), 1);

        let holder = graph.object(classes[0]).unwrap();
        assert_eq!(holder.name.as_deref(), Some("Holder"));
        let (_, name) = holder.pointer_fields().next().unwrap();
        assert_eq!(graph.object(name).unwrap().kind, MetaKind::Symbol);

        let roots = graph.static_roots();
        assert_eq!(roots.len(), 2);
        assert!(roots[1].value.is_null());
        let a = graph.heap_object(roots[0].value).unwrap();
        let (_, b) = a.reference_fields().next().unwrap();
        let (_, back) = graph.heap_object(b).unwrap().reference_fields().next().unwrap();
        assert_eq!(back, roots[0].value);
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let text = r#"{ "metadata": [
            { "id": "arr", "kind": "Array", "size": 16, "fields": [{ "offset": 8, "target": "nope" }] }
        ] }"#;
        let err = MemoryGraph::from_json(text).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let text = r#"{ "metadata": [
            { "id": "s", "kind": "Symbol", "text": "a" },
            { "id": "s", "kind": "Symbol", "text": "b" }
        ] }"#;
        assert!(MemoryGraph::from_json(text).is_err());
    }

    #[test]
    fn test_description_round_trips_through_json() {
        let description = GraphDescription::from_json(SAMPLE).unwrap();
        let again = GraphDescription::from_json(&description.to_json().unwrap()).unwrap();
        assert_eq!(description, again);
    }
}
