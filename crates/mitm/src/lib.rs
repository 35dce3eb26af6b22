//! TLS-terminating API proxy that keeps real LLM-provider keys on the
//! trusted side of the sandbox boundary.
//!
//! The sandboxed container receives fake sentinel keys and a Unix socket.
//! Outbound HTTPS arrives here as HTTP CONNECT; the proxy terminates TLS
//! with a CA-signed leaf, filters requests by `{host, method, path}`,
//! verifies the sentinel, swaps in the real key, and streams the upstream
//! response back.

pub mod ca;
pub mod handler;
pub mod providers;
pub mod proxy;
pub mod resolver;

pub use {
    ca::CertificateAuthority,
    providers::{Endpoint, KeyInjection, ProviderConfig, SentinelMap, default_providers},
    proxy::{MitmConfig, MitmProxy},
    resolver::SniCertResolver,
};
