//! Backend selection: turns a sniff result into a routing decision.
//!
//! Selection is a single exact-match lookup restricted to the protocol set
//! the sniffed connection is allowed to reach (HTTP/1 connections never
//! reach an `Http2`/`Grpc` backend and vice versa). There is no wildcard or
//! prefix matching, no load balancing between addresses, and no retries —
//! those are explicitly out of scope.

use std::sync::Arc;

use crate::registry::{Backend, BackendRegistry};
use crate::sniffer::ProtocolFamily;

/// The result of attempting to route a sniffed connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionOutcome {
    /// A backend was found and is reachable (has at least one address).
    Selected(Backend),
    /// No backend is registered for this domain at all.
    NotFound,
    /// A backend is registered for this domain, but not for the sniffed
    /// protocol family (e.g. an `Http1`-only backend reached by an HTTP/2
    /// connection), or it has no addresses.
    Unconfigured,
}

/// Selects a backend for `authority` given the sniffed `protocol_family`.
pub fn select(
    registry: &Arc<dyn BackendRegistry>,
    authority: &str,
    protocol_family: ProtocolFamily,
) -> SelectionOutcome {
    let Some(backend) = registry.lookup(authority) else {
        return SelectionOutcome::NotFound;
    };

    if !protocol_family.as_protocol_set().contains(&backend.protocol) {
        return SelectionOutcome::Unconfigured;
    }

    if !backend.is_selectable() {
        return SelectionOutcome::Unconfigured;
    }

    SelectionOutcome::Selected(backend)
}
