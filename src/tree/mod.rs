//! Tree layer
//!
//! The concurrent ordered-map logic on top of the node store: routing and
//! move-right rules, the insert/split/propagate cycle, root growth and the
//! read-only traversals.

mod algorithm;
mod navigator;
mod root;
mod visit;

pub use algorithm::TreeAlgorithm;
pub use navigator::{Route, TreeNavigator};
pub use root::RootPointer;
pub use visit::{LeafVisit, NodeVisit};
