//! Contract of the hypervisor collaborator.
//!
//! The core never talks to a hypervisor directly; the control facade is
//! handed an implementation of these traits. Implementations are assumed
//! internally thread-safe.

use std::sync::Arc;

use crate::error::Result;

/// Process-wide hypervisor connection.
pub trait Hypervisor: Send + Sync {
    /// Look up a guest by name. Failure carries the hypervisor's own
    /// message, which the facade reports verbatim.
    fn lookup_by_name(&self, name: &str) -> Result<Arc<dyn GuestDomain>>;
}

/// One guest under hypervisor management.
pub trait GuestDomain: Send + Sync {
    /// Whether the guest is currently running.
    fn is_active(&self) -> Result<bool>;

    /// Launch the guest.
    fn create(&self) -> Result<()>;

    /// Forcibly stop the guest.
    fn destroy(&self) -> Result<()>;

    /// The guest's XML descriptor document.
    fn xml_desc(&self) -> Result<String>;
}
