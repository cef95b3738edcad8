//! Graph snapshot engine.
//!
//! One traversal names every unnamed box, records geometry and ports, and
//! projects outbound connections into patch lines. Display text is attached
//! in a separate pass because not every host can read it back.

use std::collections::{HashMap, HashSet};

use patchbridge_core::codec::CodecError;
use patchbridge_core::protocol::{BoxRecord, Bounds, Endpoint, Patchline, Snapshot};
use serde_json::{Map, Value};
use tracing::debug;

use crate::graph::GraphStore;

/// Boxes whose name starts with this are bridge bookkeeping and never reported.
pub const RESERVED_PREFIX: &str = "maxmcpid";

/// Which boxes a traversal visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Patch,
    Selection,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    /// Read every attribute into the box records
    pub include_attributes: bool,
}

pub fn is_reserved(varname: &str) -> bool {
    varname.starts_with(RESERVED_PREFIX)
}

/// Capture boxes and lines in `scope`.
///
/// Unnamed boxes are named `obj-<n>` and the name is written back to the
/// live graph. `n` counts visited, non-reserved boxes from zero and skips
/// any name another box already holds.
pub fn snapshot<G: GraphStore>(graph: &mut G, scope: Scope, options: SnapshotOptions) -> Snapshot {
    let visited = {
        let g: &G = graph;
        match scope {
            Scope::Patch => g.apply_deep_if(&mut |_| true),
            Scope::Selection => g.apply_deep_if(&mut |h| g.is_selected(h)),
        }
    };
    let mut taken = used_names(graph);

    let mut counter: u64 = 0;
    let mut named: Vec<(G::Handle, String)> = Vec::with_capacity(visited.len());
    for handle in visited {
        let varname = match graph.varname(handle) {
            Some(name) if is_reserved(&name) => continue,
            Some(name) => name,
            None => {
                let mut candidate = format!("obj-{}", counter);
                while taken.contains(&candidate) {
                    counter += 1;
                    candidate = format!("obj-{}", counter);
                }
                graph.set_varname(handle, &candidate);
                taken.insert(candidate.clone());
                candidate
            }
        };
        counter += 1;
        named.push((handle, varname));
    }

    let names: HashMap<G::Handle, &str> = named.iter().map(|(h, n)| (*h, n.as_str())).collect();
    let mut snap = Snapshot::default();

    for (handle, varname) in &named {
        let attributes = options
            .include_attributes
            .then(|| attributes(&*graph, *handle));
        snap.push_box(BoxRecord {
            maxclass: graph.maxclass(*handle),
            varname: varname.clone(),
            patching_rect: graph.rect(*handle),
            numinlets: graph.num_inlets(*handle),
            numoutlets: graph.num_outlets(*handle),
            text: None,
            attributes,
        });
    }

    for (handle, varname) in &named {
        for out in graph.outputs(*handle) {
            match names.get(&out.dst) {
                Some(dst) => snap.push_line(Patchline {
                    source: Endpoint(varname.clone(), out.outlet),
                    destination: Endpoint((*dst).to_string(), out.inlet),
                }),
                None => debug!(src = %varname, "Dropping line to box outside snapshot"),
            }
        }
    }

    snap
}

/// Full attribute map of one box.
pub fn attributes<G: GraphStore>(graph: &G, handle: G::Handle) -> Map<String, Value> {
    graph
        .attr_names(handle)
        .into_iter()
        .filter_map(|name| graph.get_attr(handle, &name).map(|v| (name, v)))
        .collect()
}

/// Attach current display text to every box still present in `graph`.
pub fn enrich_text<G: GraphStore>(snapshot: &mut Snapshot, graph: &G) {
    for record in snapshot.nodes_mut() {
        let Some(handle) = graph.get_named(&record.varname) else {
            debug!(varname = %record.varname, "Box gone before enrichment");
            continue;
        };
        if let Some(text) = graph.box_text(handle) {
            record.text = Some(text);
        }
    }
}

/// [`enrich_text`] over the serialized form.
pub fn enrich_wire<G: GraphStore>(wire: &str, graph: &G) -> Result<String, CodecError> {
    let mut snap: Snapshot = serde_json::from_str(wire).map_err(CodecError::MalformedPayload)?;
    enrich_text(&mut snap, graph);
    serde_json::to_string(&snap).map_err(CodecError::Serialize)
}

/// Smallest rectangle around every non-reserved box, `None` if there are none.
pub fn avoid_rect<G: GraphStore>(graph: &G) -> Option<Bounds> {
    graph
        .apply_deep_if(&mut |h| !graph.varname(h).is_some_and(|n| is_reserved(&n)))
        .into_iter()
        .map(|h| graph.rect(h))
        .fold(None, |acc: Option<Bounds>, rect| match acc {
            None => Some(Bounds::of(&rect)),
            Some(mut b) => {
                b.include(&rect);
                Some(b)
            }
        })
}

fn used_names<G: GraphStore>(graph: &G) -> HashSet<String> {
    graph
        .apply_deep_if(&mut |_| true)
        .into_iter()
        .filter_map(|h| graph.varname(h))
        .collect()
}
