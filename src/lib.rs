//! Real-time quote feed client that enriches price ticks with cached
//! volume data refreshed in the background.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod model;
pub mod volume;
