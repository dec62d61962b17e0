pub mod core;
pub mod history;
pub mod index;
pub mod pipeline;
pub mod provider;
pub mod server;
pub mod state;
