//! Client side of souk conversations: the live gateway connection, the REST
//! fallback, and the timeline both feed.

pub mod error;
pub mod realtime;
pub mod rest;
pub mod send;
pub mod sync;
pub mod timeline;

pub use error::ClientError;
pub use realtime::{ConnectionStatus, RealtimeClient, RealtimeConfig};
pub use rest::{MessageApi, RestClient};
pub use send::{Composer, LiveChannel, SendPath};
pub use sync::FallbackSync;
pub use timeline::{MessageTimeline, SharedTimeline};
