//! Dependency Ordering
//!
//! Flattens a load context's module graph into a linear order where every
//! module appears after all of its imports, so the host can run module
//! initializers dependency-first.
//!
//! ```text
//!               foo.app
//!              /    |    \
//!          c.dll  gfx.dll  bar.dll
//!           /               \
//!       some.dll            c.dll
//! ```
//! becomes `[some.dll, c.dll, gfx.dll, bar.dll, foo.app]`.
//!
//! The walk repeatedly extracts a vertex with no unresolved imports and
//! strikes it from everyone else's adjacency. Imports form a DAG in PE, so
//! the walk always drains; a cycle (which only a corrupt context could
//! produce) is reported instead of spinning.

use log::{error, trace};

use crate::error::OsError;
use crate::pe::context::{LoadContext, ModuleMapEntry};

fn build_dependency_list(ctx: &LoadContext) -> Result<Vec<&ModuleMapEntry>, OsError> {
    trace!("build_dependency_list(modules={})", ctx.module_count());

    let mut elements: Vec<(&ModuleMapEntry, Vec<u32>)> = ctx
        .module_map
        .values()
        .map(|entry| {
            let vertices = entry.imports.iter().map(|import| import.id).collect();
            (entry, vertices)
        })
        .collect();
    let mut done = vec![false; elements.len()];
    let mut ordered = Vec::with_capacity(elements.len());

    while ordered.len() < elements.len() {
        let next = elements
            .iter()
            .enumerate()
            .find(|(index, (_, vertices))| !done[*index] && vertices.is_empty())
            .map(|(index, _)| index);

        let index = match next {
            Some(index) => index,
            None => {
                error!("build_dependency_list import graph contains a cycle");
                return Err(OsError::Unknown);
            }
        };

        let removed_id = elements[index].0.id;
        ordered.push(elements[index].0);
        done[index] = true;
        for (other, (_, vertices)) in elements.iter_mut().enumerate() {
            if !done[other] {
                vertices.retain(|&id| id != removed_id);
            }
        }
    }
    Ok(ordered)
}

/// Module keys in dependency order: every key after the keys of all the
/// modules it imports.
pub fn module_keys(ctx: &LoadContext) -> Result<Vec<String>, OsError> {
    let ordered = build_dependency_list(ctx)?;
    Ok(ordered.into_iter().map(|entry| entry.name.clone()).collect())
}

/// Module entry point addresses in dependency order; the host jumps to
/// each in turn to run initializers.
pub fn module_entry_points(ctx: &LoadContext) -> Result<Vec<u64>, OsError> {
    let ordered = build_dependency_list(ctx)?;
    ordered
        .into_iter()
        .map(|entry| {
            let parsed = entry.module.parsed()?;
            Ok(entry.base_mapping + parsed.entry_point_rva as u64)
        })
        .collect()
}
