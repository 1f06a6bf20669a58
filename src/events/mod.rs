//! In-process notifications about branch and merge changes.
//!
//! Subscribers receive events through bounded channels; a subscriber whose
//! buffer overflows is dropped and told so with a final
//! [`BranchEvent::Dropped`] event.
//!
//! # Example
//!
//! ```ignore
//! let handle = manager.events().subscribe(SubscriptionConfig {
//!     filter: EventFilter::branches().under("MAIN/project"),
//!     ..Default::default()
//! });
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         BranchEvent::Committed { path, head } => println!("{path} -> {head}"),
//!         BranchEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{
    BranchEvent, BranchSummary, DropReason, EventFilter, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId,
};
