//! Open/click/unsubscribe tracking
//!
//! Outbound side: [`TrackingInjector`] rewrites HTML bodies before enqueue.
//! Inbound side: [`TrackingService`] records events hitting the tracking
//! endpoints and updates the aggregate counters.

mod html;
pub mod signing;
mod service;
pub mod user_agent;

pub use html::{
    click_payload, new_tracking_id, unsubscribe_payload, TrackingInjector, TrackingOptions,
};
pub use service::{EventDetails, RecordOutcome, TrackingService};
