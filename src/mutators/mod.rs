//! The idempotent create/update/delete procedures that turn a decided
//! [`crate::events::DomainEvent`] into local cluster state (§4.4-§4.7).

pub mod headless;
pub mod objects;
pub mod repair;
pub mod service;

use crate::{cluster::LocalCluster, link::Link, recorder::Record, resolver::Resolve};

/// Shared collaborators every mutator needs. Bundled so call sites in
/// [`crate::reconciler`] don't have to thread five parameters through every
/// function.
pub struct Deps<'a> {
    pub local: &'a dyn LocalCluster,
    pub resolver: &'a dyn Resolve,
    pub recorder: &'a dyn Record,
    pub link: &'a Link,
    pub enable_headless: bool,
}
