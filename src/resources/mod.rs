pub mod certificate;
pub mod common;
pub mod jobs;
pub mod monitor;
pub mod rbac;
pub mod secret;
pub mod service;
pub mod statefulset;

pub use common::{
    API_VERSION, FIELD_MANAGER, KIND, Verb, create_if_absent, create_or_patch, delete_if_exists, offshoot_labels,
    owner_reference,
};
