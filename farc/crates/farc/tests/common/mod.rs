//! Test Utilities for the FARC Test Suite
//!
//! Fixtures build small but complete live graphs, run the builder over them
//! and write the result to a scratch directory. Assertions in the suites are
//! exact: byte equality, exact counts, exact addresses.

#![allow(dead_code)]

use farc::{
    ArchiveBuilder, ArchiveConfig, ArchiveFile, ArchivedClass, BuiltArchive, ClassInitializer,
    LiveVtables, MemoryGraph, MetaKind, SourceAddr, StaticFieldSink,
};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tempfile::TempDir;

/// Core region alignment used by every fixture
pub const TEST_ALIGNMENT: usize = 4096;

/// Configuration without heap archiving
pub fn core_config() -> ArchiveConfig {
    ArchiveConfig {
        heap_archiving: false,
        core_region_alignment: TEST_ALIGNMENT,
        ..Default::default()
    }
}

/// Configuration with heap archiving
pub fn heap_config() -> ArchiveConfig {
    ArchiveConfig {
        heap_archiving: true,
        heap_capacity: 1024 * 1024,
        max_heap_object_size: 64 * 1024,
        ..core_config()
    }
}

/// ============================================================================
/// GRAPH FIXTURE
/// ============================================================================

/// A small application graph
///
/// ```text
/// app/Main ──name──▶ "app/Main"
///    │ methods
///    ▼
/// Method main ──pool──▶ ConstantPool ──▶ "app/Util" ◀── app/Util name
///    │ data
///    ▼
/// MethodData (profiling, excluded)
/// ```
pub struct GraphFixture {
    pub graph: MemoryGraph,
    pub main: SourceAddr,
    pub util: SourceAddr,
    pub method: SourceAddr,
    pub pool: SourceAddr,
    pub profile: SourceAddr,
}

impl GraphFixture {
    /// Build the graph, adding classes in `util_first` order
    ///
    /// **Bug this finds:** output that depends on creation order
    pub fn new(util_first: bool) -> Self {
        let mut graph = MemoryGraph::new();
        // Explicit keys keep symbol order independent of creation order
        let (util_name, main_name) = if util_first {
            let u = graph.add_symbol_with_key("app/Util", 2);
            let m = graph.add_symbol_with_key("app/Main", 1);
            (u, m)
        } else {
            let m = graph.add_symbol_with_key("app/Main", 1);
            let u = graph.add_symbol_with_key("app/Util", 2);
            (u, m)
        };

        let (util, main) = if util_first {
            let u = add_class(&mut graph, "app/Util");
            let m = add_class(&mut graph, "app/Main");
            (u, m)
        } else {
            let m = add_class(&mut graph, "app/Main");
            let u = add_class(&mut graph, "app/Util");
            (u, m)
        };
        graph.set_pointer(main, 8, main_name).unwrap();
        graph.set_pointer(util, 8, util_name).unwrap();
        graph.set_word(main, 24, 0xfeed).unwrap();

        let method = graph.add_metadata(MetaKind::Method, 32).unwrap();
        let pool = graph.add_metadata(MetaKind::ConstantPool, 32).unwrap();
        let profile = graph.add_metadata(MetaKind::MethodData, 16).unwrap();
        graph.set_pointer(main, 16, method).unwrap();
        graph.set_pointer(method, 8, pool).unwrap();
        graph.set_pointer(method, 16, profile).unwrap();
        graph.set_pointer(pool, 8, util_name).unwrap();
        graph.set_pointer(pool, 16, main).unwrap();

        Self {
            graph,
            main,
            util,
            method,
            pool,
            profile,
        }
    }
}

/// Class of 32 bytes: dispatch word, name, one pointer, one data word
pub fn add_class(graph: &mut MemoryGraph, name: &str) -> SourceAddr {
    graph.add_class(MetaKind::InstanceClass, name, 32).unwrap()
}

/// Build `graph` with the standard live tables
pub fn build(graph: &MemoryGraph, config: ArchiveConfig) -> BuiltArchive {
    let live = LiveVtables::standard();
    ArchiveBuilder::new(config, graph, &live)
        .expect("configuration should be valid")
        .build()
        .expect("build should succeed")
}

/// ============================================================================
/// FILE FIXTURE
/// ============================================================================

/// A written archive in a scratch directory
pub struct WrittenArchive {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl WrittenArchive {
    /// **Bug this finds:** writer/loader disagreement on the file layout
    pub fn new(built: &BuiltArchive) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.farc");
        built.write(&path).expect("write should succeed");
        Self { dir, path }
    }

    pub fn open(&self, config: &ArchiveConfig) -> ArchiveFile {
        ArchiveFile::open(&self.path, config).expect("archive should open")
    }

    pub fn bytes(&self) -> Vec<u8> {
        std::fs::read(&self.path).unwrap()
    }
}

/// ============================================================================
/// RESTORE COLLABORATORS
/// ============================================================================

/// Shared, ordered event log of one restore session
pub type RestoreLog = Rc<RefCell<Vec<String>>>;

/// Initializer that fails on one class
pub struct RecordingInitializer {
    pub log: RestoreLog,
    pub fail_on: Option<String>,
}

impl ClassInitializer for RecordingInitializer {
    fn initialize(&mut self, class: &ArchivedClass) -> Result<(), String> {
        self.log.borrow_mut().push(format!("init {}", class.name));
        if self.fail_on.as_deref() == Some(class.name.as_str()) {
            return Err("static initializer threw".to_string());
        }
        Ok(())
    }
}

/// Sink remembering every published value
pub struct RecordingSink {
    pub log: RestoreLog,
    pub published: Vec<(String, u32, u64)>,
}

impl StaticFieldSink for RecordingSink {
    fn publish(&mut self, holder: &ArchivedClass, field_offset: u32, value: u64) {
        self.log
            .borrow_mut()
            .push(format!("publish {}+{field_offset}", holder.name));
        self.published.push((holder.name.clone(), field_offset, value));
    }

    fn clear(&mut self, holder: &ArchivedClass, field_offset: u32) {
        self.log
            .borrow_mut()
            .push(format!("clear {}+{field_offset}", holder.name));
    }
}

/// Initializer and sink sharing one log
pub fn restore_collaborators(fail_on: Option<&str>) -> (RestoreLog, RecordingInitializer, RecordingSink) {
    let log = RestoreLog::default();
    let initializer = RecordingInitializer {
        log: log.clone(),
        fail_on: fail_on.map(str::to_string),
    };
    let sink = RecordingSink {
        log: log.clone(),
        published: Vec::new(),
    };
    (log, initializer, sink)
}
