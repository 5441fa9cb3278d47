//! # Shared Constants
//!
//! Names shared between the credential resolver, the backends and the binary.

/// Environment variable holding the fallback Graph API access token.
pub const FBPCS_GRAPH_API_TOKEN: &str = "FBPCS_GRAPH_API_TOKEN";

/// Base URL of the Graph API version the coordinator speaks.
pub const GRAPH_API_URL: &str = "https://graph.facebook.com/v13.0";
