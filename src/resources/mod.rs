pub mod common;
pub mod pod;
pub mod pvc;
pub mod secret;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
