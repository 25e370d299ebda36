//! HTTP front end exposing admission control over a few demo routes.

mod routes;
mod server;

pub use server::HttpServer;

/// Header carrying the caller's admission key.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Key used when a request carries no client id.
pub const DEFAULT_CLIENT_KEY: &str = "global";
