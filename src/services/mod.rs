pub mod clock;
pub mod engine;
pub mod poller;
pub mod registry;
pub mod remote;
pub mod upload;
