pub mod api;
pub mod app;
pub mod channel;
pub mod config;
pub mod devserver;
pub mod model;
pub mod updates;

pub use model::{ConnectionState, StatusEvent, TaskFrame};
pub use updates::{
    ChannelPolicy, EnvironmentSignal, SubscribeError, TaskUpdateClient, TaskUpdateClientBuilder,
};
