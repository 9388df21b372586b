//! Port traits for the chat client.
//!
//! The manager only talks to the outside world through these boundaries.

pub mod outbound;
