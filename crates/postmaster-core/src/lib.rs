//! Core building blocks for the PostMaster message log.
//!
//! This crate provides:
//! - `CapturedEvent` - A cross-document message as captured by the probe
//! - `validate` - Schema check for untrusted inbound payloads
//! - `filter` - Pattern compiler and composite field filters
//! - `EventStore` - Bounded, pausable event buffer with subscribers
//! - `LogView` - Render-time sorting, search and formatting

pub mod event;
pub mod filter;
pub mod store;
pub mod view;

pub use event::{CapturedEvent, ValidationError, parse_event, validate};
pub use filter::{
    ActiveFilter, CompositeFilter, Field, FieldPattern, FilterError, FilterInput, Matcher,
};
pub use store::{DEFAULT_CAPACITY, EventStore, StoreConfig, StoreState, Subscription};
pub use view::{ExclusionBar, FilterBar, LogView, RenderedEvent, SortOrder};
