//! Tenant database access: the connection router (the single chokepoint
//! for tenant queries) and the provisioner that creates and tears down
//! tenant databases, roles, and namespaces.

pub mod provision;
pub mod router;

pub use provision::{CreateProjectInput, CreatedProject, Provisioner};
pub use router::TenantRouter;
