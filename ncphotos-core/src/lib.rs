mod client;
mod oauth;

pub use client::{ApiErrorClass, DavClient, DavEntry, DavError};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
