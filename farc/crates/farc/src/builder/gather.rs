//! Gather phase
//!
//! Iterative preorder walk from the roots. Each address is decided exactly
//! once, the first time the walk reaches it; later reaches only find the
//! existing record. Root order is fixed by sorting, never by enumeration
//! order of the live tables, so repeated builds of the same graph walk the
//! same way.

use super::BaseArchive;
use crate::address::SourceAddr;
use crate::catalog::{Catalog, Disposition, RecordId};
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::graph::{SourceGraph, SourceObject};
use crate::logging::{BuildEvent, BuildLogger};
use crate::space::RegionKind;

/// Copy order produced by the walk
#[derive(Debug, Default)]
pub(crate) struct GatherPlan {
    /// Copied rw objects, in walk order
    pub rw: Vec<RecordId>,
    /// Copied ro objects, in walk order
    pub ro: Vec<RecordId>,
    /// Copied classes, by name
    pub classes: Vec<RecordId>,
    /// Copied symbols, by (sort key, bytes)
    pub symbols: Vec<RecordId>,
    pub nullified: usize,
    pub redirected: usize,
}

/// Decide and record every object reachable from the roots
pub(crate) fn gather(
    source: &dyn SourceGraph,
    catalog: &mut Catalog,
    config: &ArchiveConfig,
    base: Option<&BaseArchive>,
    logger: &BuildLogger,
) -> Result<GatherPlan> {
    let mut walker = Walker {
        source,
        catalog,
        config,
        base,
        logger,
        plan: GatherPlan::default(),
    };

    for root in sorted_classes(source)? {
        walker.walk(root)?;
    }
    for root in sorted_symbols(source)? {
        walker.walk(root)?;
    }
    for root in source.extra_roots() {
        walker.walk(root)?;
    }

    let mut plan = walker.plan;
    plan.classes = sorted_copies(catalog, source, |obj| obj.kind.is_class(), |a, b| a.name.cmp(&b.name));
    plan.symbols = sorted_copies(
        catalog,
        source,
        |obj| obj.kind == crate::graph::MetaKind::Symbol,
        |a, b| (a.sort_key, &a.bytes).cmp(&(b.sort_key, &b.bytes)),
    );
    log::debug!(
        target: "farc::builder",
        "gathered {} rw, {} ro, {} nullified, {} redirected",
        plan.rw.len(),
        plan.ro.len(),
        plan.nullified,
        plan.redirected
    );
    Ok(plan)
}

fn object_at(source: &dyn SourceGraph, addr: SourceAddr) -> Result<&SourceObject> {
    source
        .object(addr)
        .ok_or(ArchiveError::UnknownObject { address: addr.raw() })
}

fn sorted_classes(source: &dyn SourceGraph) -> Result<Vec<SourceAddr>> {
    let mut classes = source
        .class_roots()
        .into_iter()
        .map(|addr| Ok((object_at(source, addr)?.name.clone(), addr)))
        .collect::<Result<Vec<_>>>()?;
    classes.sort();
    Ok(classes.into_iter().map(|(_, addr)| addr).collect())
}

fn sorted_symbols(source: &dyn SourceGraph) -> Result<Vec<SourceAddr>> {
    let mut symbols = source
        .symbol_roots()
        .into_iter()
        .map(|addr| {
            let obj = object_at(source, addr)?;
            Ok((obj.sort_key, obj.bytes.as_slice(), addr))
        })
        .collect::<Result<Vec<_>>>()?;
    symbols.sort();
    Ok(symbols.into_iter().map(|(_, _, addr)| addr).collect())
}

fn sorted_copies(
    catalog: &Catalog,
    source: &dyn SourceGraph,
    filter: impl Fn(&SourceObject) -> bool,
    order: impl Fn(&SourceObject, &SourceObject) -> std::cmp::Ordering,
) -> Vec<RecordId> {
    let mut copies: Vec<(RecordId, &SourceObject)> = catalog
        .iter()
        .filter(|(_, record)| record.is_copied())
        .filter_map(|(id, record)| source.object(record.source).map(|obj| (id, obj)))
        .filter(|(_, obj)| filter(obj))
        .collect();
    copies.sort_by(|(a_id, a), (b_id, b)| order(a, b).then(a_id.cmp(b_id)));
    copies.into_iter().map(|(id, _)| id).collect()
}

struct Walker<'a> {
    source: &'a dyn SourceGraph,
    catalog: &'a mut Catalog,
    config: &'a ArchiveConfig,
    base: Option<&'a BaseArchive>,
    logger: &'a BuildLogger,
    plan: GatherPlan,
}

impl Walker<'_> {
    fn walk(&mut self, root: SourceAddr) -> Result<()> {
        let mut stack = vec![root];
        while let Some(addr) = stack.pop() {
            if addr.is_null() || self.catalog.lookup(addr).is_some() {
                continue;
            }

            if self.base.is_some_and(|base| base.contains(addr.raw())) {
                self.catalog
                    .intern(addr, Disposition::RedirectToExistingArchiveCopy, None)?;
                self.plan.redirected += 1;
                continue;
            }

            let object = object_at(self.source, addr)?;
            if let Some(reason) = self.exclusion(object) {
                self.catalog.intern(addr, Disposition::Nullify, Some(object))?;
                self.plan.nullified += 1;
                self.logger.log(BuildEvent::ObjectNullified {
                    address: addr.raw(),
                    kind: object.kind.to_string(),
                    reason: reason.to_string(),
                });
                continue;
            }

            let (id, _) = self.catalog.intern(addr, Disposition::Copy, Some(object))?;
            match object.kind.region() {
                RegionKind::ReadWrite => self.plan.rw.push(id),
                RegionKind::ReadOnly => self.plan.ro.push(id),
            }

            let mut fields = Vec::new();
            self.source
                .visit_fields(addr, &mut |_, target| fields.push(target));
            stack.extend(fields.into_iter().rev().filter(|t| !t.is_null()));
        }
        Ok(())
    }

    fn exclusion(&self, object: &SourceObject) -> Option<&'static str> {
        if self.config.excluded_kinds.contains(&object.kind) {
            Some("kind excluded from archiving")
        } else if object.unrepresentable {
            Some("failed eligibility checks")
        } else {
            None
        }
    }
}
