pub mod anthropic;
pub mod app;
pub mod auth;
pub mod bedrock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod eventstream;
pub mod handlers;
pub mod normalize;
pub mod sigv4;
pub mod stream;
pub mod tokens;
pub mod translate;
pub mod upstream;
