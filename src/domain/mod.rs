//! Domain layer - Core provisioning types and port definitions
//!
//! This module defines the traits (ports) that adapters implement, plus the
//! Kubernetes label-selector and resource-quantity semantics the provisioning
//! logic is built on.

pub mod claim;
pub mod ports;
pub mod quantity;
pub mod selector;

pub use claim::{claim_class_name, claim_key, provisioned_volume_name};
pub use ports::*;
pub use quantity::{parse_quantity, quantity_bytes};
pub use selector::Selector;
