//! Marking: worklists, visitors, the marker and write barriers.

pub(crate) mod concurrent;
pub(crate) mod marker;
pub(crate) mod remembered_set;
pub(crate) mod visitor;
pub(crate) mod worklists;
pub(crate) mod write_barrier;

pub use marker::{MarkerState, MarkingLimits};
pub use write_barrier::{
    dijkstra_marking_barrier_range, generational_barrier_for_source_object,
    is_any_incremental_or_concurrent_marking, steele_marking_barrier,
};
