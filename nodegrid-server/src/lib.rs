//! Node factory and compact multi-scheduler process driver (spec §4.9
//! "Node factory & Compact server"): composes `nodegrid-address`,
//! `nodegrid-gate`, `nodegrid-scheduler`, `nodegrid-pqueue`, and
//! `nodegrid-jobs` into a runnable process with one or more named
//! nodes sharing a durable store.

mod compact_server;
mod factory;

pub use compact_server::CompactServer;
pub use factory::NodeFactory;
