//! Graphviz rendering
//!
//! Writes the reachable tree as a `dot` digraph: solid edges for child
//! pointers, dashed edges for right links. Meant for debugging sessions and
//! for the failure dumps the tree facade can emit, not for huge trees.

use crate::node::NodeId;
use crate::store::NodeStore;
use crate::tree::NodeVisit;
use crate::Result;
use std::fmt::Debug;
use std::io::Write;
use std::path::Path;

/// Render every node reachable from `root` into `out`
pub fn render<K, V, W>(store: &dyn NodeStore<K, V>, root: NodeId, out: &mut W) -> Result<()>
where
    K: Debug,
    W: Write,
{
    writeln!(out, "digraph blinktree {{")?;
    writeln!(out, "    node [shape=record, fontname=\"monospace\"];")?;
    for node in NodeVisit::new(store, root) {
        let node = node?;

        let mut keys = Vec::with_capacity(node.occupancy());
        for index in 0..node.occupancy() {
            let key = format!("{:?}", node.key_at(index)?).replace('"', "\\\"");
            keys.push(key);
        }
        let kind = if node.is_leaf() { "leaf" } else { "node" };
        writeln!(
            out,
            "    n{} [label=\"{} {} | {}\"];",
            node.id(),
            kind,
            node.id(),
            keys.join(" | ")
        )?;

        if node.is_internal() {
            for index in 0..node.occupancy() {
                writeln!(out, "    n{} -> n{};", node.id(), node.child_at(index)?)?;
            }
        }
        if let Some(link) = node.link()? {
            writeln!(
                out,
                "    n{} -> n{} [style=dashed, constraint=false];",
                node.id(),
                link
            )?;
        }
    }
    writeln!(out, "}}")?;
    Ok(())
}

/// Render into a freshly created file at `path`
pub fn dump_to_path<K, V>(store: &dyn NodeStore<K, V>, root: NodeId, path: &Path) -> Result<()>
where
    K: Debug,
{
    let mut file = std::fs::File::create(path)?;
    render(store, root, &mut file)
}
