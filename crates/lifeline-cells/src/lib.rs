//! Lifeline Trust Cells
//!
//! Fixed four-member groups ("tetrahedrons") with a canonical identity.
//!
//! # The K4 Invariant
//!
//! Every cell has exactly [`CELL_SIZE`] distinct members. Each member is
//! connected to the other three, giving [`EDGES_PER_CELL`] edges: the
//! complete graph K4.
//!
//! # Canonical Identity
//!
//! A cell id is a BLAKE3 hash over the sorted member ids, each framed with
//! its length. Any permutation of the same four ids yields the same
//! [`GroupId`], so a second registration of the same set is rejected no
//! matter the order it arrives in.
//!
//! # Topology
//!
//! A pure K4 topology places every peer in exactly one active cell.
//! [`GroupRegistry::validate_topology`] reports peers that sit in more than
//! one, but never blocks registration.

mod error;
mod group;
mod heartbeat;
mod registry;

pub use error::{GroupError, Result};
pub use group::{GroupId, TrustGroup};
pub use heartbeat::{Capacity, GroupHeartbeat, StatusFlags, PANIC_ABOVE, SILENT_BELOW};
pub use registry::{GroupRegistry, TopologyReport, TopologyViolation};

/// Members per trust cell (invariant: always 4).
pub const CELL_SIZE: usize = 4;

/// Edges in a complete graph over one cell.
pub const EDGES_PER_CELL: usize = 6;

// K4 has n(n-1)/2 edges
const _: () = assert!(CELL_SIZE * (CELL_SIZE - 1) / 2 == EDGES_PER_CELL);
