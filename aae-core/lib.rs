//! Active anti-entropy fullsync exchange engine, Merkle helper and cascade
//! topology model.
//!
//! Three independent components (specification §2): the [`exchange`] engine
//! (~55% of the design), the [`merkle_helper`] (~30%), and [`cascade`]
//! (~15%). [`hashtree`], [`vnode`] and [`objhelper`] are the external
//! collaborator boundaries (specification §6) the first two are built
//! against.

pub mod cascade;
pub mod exchange;
pub mod hashtree;
pub mod merkle_helper;
pub mod objhelper;
pub mod types;
pub mod vnode;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use exchange::{EngineEvent, EngineState, ExchangeEngine, FullsyncOutcome};
