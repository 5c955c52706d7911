//! Status-check probe construction and liveness accounting
//!
//! Each connection with status checks enabled owns one synthetic probe
//! request, built once from the configured attribute template and reused
//! for every probe. Probes always run at maximum priority and are never
//! retransmitted: each send takes a fresh ID, and only contiguous good
//! replies count toward bringing the connection up.

use crate::code::Code;
use crate::config::StatusCheckSettings;
use crate::request::{Attribute, ProtocolRequest};
use crate::wire;
use std::time::Instant;

/// Build the reusable probe request for one connection.
///
/// The template is scrubbed: Proxy-State and Message-Authenticator are
/// signalling attributes the encoder manages itself, and a password only
/// makes sense when the probe is a real Access-Request. A NAS-Identifier
/// is added if the template has none.
pub(crate) fn build_probe(settings: &StatusCheckSettings, now: Instant) -> ProtocolRequest {
    let mut request = ProtocolRequest::new(settings.code, u32::MAX, now);
    request.status_check = true;

    for attr in &settings.attributes {
        match attr.attr_type {
            wire::ATTR_PROXY_STATE | wire::ATTR_MESSAGE_AUTHENTICATOR => continue,
            wire::ATTR_USER_PASSWORD if settings.code != Code::AccessRequest.as_u8() => continue,
            _ => request.attributes.push(attr.clone()),
        }
    }

    if !request
        .attributes
        .iter()
        .any(|a| a.attr_type == wire::ATTR_NAS_IDENTIFIER)
    {
        request.attributes.push(Attribute::string(
            wire::ATTR_NAS_IDENTIFIER,
            "status check - are you alive?",
        ));
    }

    request
}

/// Contiguous good replies required before the connection goes active.
///
/// After a trunk-level failure we are careful and demand the configured
/// count; on a clean start a single reply is proof enough.
pub(crate) fn answers_required(
    num_answers_to_alive: u32,
    last_failed: Option<Instant>,
    last_connected: Option<Instant>,
) -> u32 {
    let failed_since_connected = match (last_failed, last_connected) {
        (Some(failed), Some(connected)) => failed > connected,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if failed_since_connected {
        num_answers_to_alive
    } else {
        1
    }
}
