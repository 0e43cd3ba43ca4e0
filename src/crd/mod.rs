mod arango_backup;
mod arango_deployment;
mod deployment_status;
mod server_group;

pub use arango_backup::*;
pub use arango_deployment::*;
pub use deployment_status::*;
pub use server_group::*;
