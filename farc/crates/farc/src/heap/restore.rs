//! Subgraph Restoration
//!
//! Load-side counterpart of the heap archiver. For one holder class:
//!
//! 1. initialize every class on the record's class list
//! 2. only then publish each archived root into its static field
//!
//! A class that fails to initialize leaves every field of the record
//! cleared; nothing of the subgraph becomes visible. Each record is
//! attempted at most once.

use crate::address::ArchiveOffset;
use crate::error::{ArchiveError, Result};
use std::fmt;

/// Archived class as seen by a loader
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchivedClass {
    pub offset: ArchiveOffset,
    pub name: String,
}

impl fmt::Display for ArchivedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One archived static field of a holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordEntry {
    pub field_offset: u32,
    pub root_index: u32,
}

/// Decoded subgraph record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphRecord {
    pub holder: ArchivedClass,
    pub entries: Vec<RecordEntry>,
    pub classes: Vec<ArchivedClass>,
}

/// Collaborator: class-loading subsystem
pub trait ClassInitializer {
    /// Resolve and initialize `class`; the error is the reason it failed
    fn initialize(&mut self, class: &ArchivedClass) -> std::result::Result<(), String>;
}

/// Collaborator: where restored field values go
pub trait StaticFieldSink {
    /// Make `value` (a mapped heap address) visible in the field
    fn publish(&mut self, holder: &ArchivedClass, field_offset: u32, value: u64);

    /// Leave the field unrestored
    fn clear(&mut self, holder: &ArchivedClass, field_offset: u32);
}

/// Result of one `restore` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { fields: usize },
    AlreadyRestored,
    InitializationFailed { class: String, reason: String },
    /// The holder has no archived subgraph
    NoSubgraph,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordState {
    Pending,
    Restored,
    Failed { class: String, reason: String },
}

/// Restores archived static-field subgraphs
#[derive(Debug)]
pub struct SubgraphRestorer {
    records: Vec<SubgraphRecord>,
    states: Vec<RecordState>,
    /// Mapped addresses of the roots array entries
    roots: Vec<u64>,
}

impl SubgraphRestorer {
    pub fn new(records: Vec<SubgraphRecord>, roots: Vec<u64>) -> Result<Self> {
        for record in &records {
            if let Some(entry) = record
                .entries
                .iter()
                .find(|e| e.root_index as usize >= roots.len())
            {
                return Err(ArchiveError::BadHeader(format!(
                    "{} field at {} uses root {} of {}",
                    record.holder,
                    entry.field_offset,
                    entry.root_index,
                    roots.len()
                )));
            }
        }
        Ok(Self {
            states: vec![RecordState::Pending; records.len()],
            records,
            roots,
        })
    }

    pub fn records(&self) -> &[SubgraphRecord] {
        &self.records
    }

    pub fn is_restored(&self, holder: &str) -> bool {
        self.position(holder)
            .is_some_and(|i| self.states[i] == RecordState::Restored)
    }

    fn position(&self, holder: &str) -> Option<usize> {
        self.records.iter().position(|r| r.holder.name == holder)
    }

    /// Restore every archived field of `holder`
    pub fn restore(
        &mut self,
        holder: &str,
        initializer: &mut dyn ClassInitializer,
        sink: &mut dyn StaticFieldSink,
    ) -> Result<RestoreOutcome> {
        let Some(index) = self.position(holder) else {
            return Ok(RestoreOutcome::NoSubgraph);
        };
        match &self.states[index] {
            RecordState::Pending => {},
            RecordState::Restored => return Ok(RestoreOutcome::AlreadyRestored),
            RecordState::Failed { class, reason } => {
                return Ok(RestoreOutcome::InitializationFailed {
                    class: class.clone(),
                    reason: reason.clone(),
                })
            },
        }

        let record = &self.records[index];
        for class in &record.classes {
            if let Err(reason) = initializer.initialize(class) {
                log::warn!(
                    target: "farc::loader",
                    "{} subgraph not restored: initializing {} failed: {}",
                    record.holder,
                    class,
                    reason
                );
                for entry in &record.entries {
                    sink.clear(&record.holder, entry.field_offset);
                }
                self.states[index] = RecordState::Failed {
                    class: class.name.clone(),
                    reason: reason.clone(),
                };
                return Ok(RestoreOutcome::InitializationFailed {
                    class: class.name.clone(),
                    reason,
                });
            }
        }

        for entry in &record.entries {
            sink.publish(
                &record.holder,
                entry.field_offset,
                self.roots[entry.root_index as usize],
            );
        }
        let fields = record.entries.len();
        self.states[index] = RecordState::Restored;
        log::debug!(target: "farc::loader", "restored {fields} fields of {holder}");
        Ok(RestoreOutcome::Restored { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str, offset: u64) -> ArchivedClass {
        ArchivedClass {
            offset: ArchiveOffset(offset),
            name: name.to_string(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
        fail: Option<&'static str>,
    }

    impl ClassInitializer for Recorder {
        fn initialize(&mut self, class: &ArchivedClass) -> std::result::Result<(), String> {
            self.log.push(format!("init {}", class.name));
            match self.fail {
                Some(name) if name == class.name => Err("boom".to_string()),
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct Fields {
        log: Vec<String>,
    }

    impl StaticFieldSink for Fields {
        fn publish(&mut self, holder: &ArchivedClass, field_offset: u32, value: u64) {
            self.log.push(format!("publish {}+{} = {:#x}", holder.name, field_offset, value));
        }

        fn clear(&mut self, holder: &ArchivedClass, field_offset: u32) {
            self.log.push(format!("clear {}+{}", holder.name, field_offset));
        }
    }

    fn restorer() -> SubgraphRestorer {
        let record = SubgraphRecord {
            holder: class("Cache", 0x100),
            entries: vec![RecordEntry {
                field_offset: 16,
                root_index: 0,
            }],
            classes: vec![class("Entry", 0x200)],
        };
        SubgraphRestorer::new(vec![record], vec![0x7f00_0000]).unwrap()
    }

    #[test]
    fn test_classes_initialized_before_publish_and_only_once() {
        let mut restorer = restorer();
        let mut init = Recorder::default();
        let mut fields = Fields::default();

        let outcome = restorer.restore("Cache", &mut init, &mut fields).unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { fields: 1 });
        assert_eq!(init.log, vec!["init Entry"]);
        assert_eq!(fields.log, vec!["publish Cache+16 = 0x7f000000"]);

        let again = restorer.restore("Cache", &mut init, &mut fields).unwrap();
        assert_eq!(again, RestoreOutcome::AlreadyRestored);
        assert_eq!(init.log.len(), 1);
        assert!(restorer.is_restored("Cache"));
    }

    #[test]
    fn test_failed_initialization_clears_fields() {
        let mut restorer = restorer();
        let mut init = Recorder {
            fail: Some("Entry"),
            ..Default::default()
        };
        let mut fields = Fields::default();

        let outcome = restorer.restore("Cache", &mut init, &mut fields).unwrap();
        assert!(matches!(outcome, RestoreOutcome::InitializationFailed { ref class, .. } if class == "Entry"));
        assert_eq!(fields.log, vec!["clear Cache+16"]);
        assert!(!restorer.is_restored("Cache"));
    }

    #[test]
    fn test_unknown_holder() {
        let mut restorer = restorer();
        let outcome = restorer
            .restore("Other", &mut Recorder::default(), &mut Fields::default())
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::NoSubgraph);
    }

    #[test]
    fn test_root_index_out_of_range_rejected() {
        let record = SubgraphRecord {
            holder: class("Cache", 0x100),
            entries: vec![RecordEntry {
                field_offset: 16,
                root_index: 3,
            }],
            classes: Vec::new(),
        };
        assert!(SubgraphRestorer::new(vec![record], vec![0x10]).is_err());
    }
}
