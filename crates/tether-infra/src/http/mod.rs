//! Outbound HTTP adapters: callback delivery and JSON integrations.

pub mod callback;
pub mod integration;

pub use callback::HttpCallbackNotifier;
pub use integration::HttpJsonIntegration;
