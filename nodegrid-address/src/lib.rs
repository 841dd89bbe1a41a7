//! # nodegrid-address
//!
//! Address parsing and the node registry (address book) used by the
//! scheduler to resolve roles, virtual paths, and fixed node addresses
//! to concrete destinations.

mod address;
mod registry;

pub use address::{
    Address, AddressForm, ADDR_ALL, ADDR_CONTROL, ADDR_LOCAL, ADDR_LOG, ADDR_NULL, ADDR_THIS,
};
pub use registry::{EntryFeatures, Registry, RegistryEntry};
