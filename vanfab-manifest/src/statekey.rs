//! State-key vocabulary.
//!
//! A state key names one unit of per-peer state exchanged over the sync
//! protocol. The engine treats keys as opaque; the bridge, claim server,
//! and compose engine construct and interpret them through this type. The
//! compose engine emits `component-*` and `iface-<role>-*` keys for member
//! application state; member-site fetches fall through to the compose cache
//! for any key that does not parse.

use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// Client credential secret for a site
    TlsSite(Uuid),
    /// Server credential secret for an access point
    TlsServer(Uuid),
    /// Access point descriptor (kind, bind host)
    Access(Uuid),
    /// Runtime-discovered host/port for an access point; advertised by the
    /// router, consumed by the controller
    AccessStatus(Uuid),
    /// Inter-router or edge link descriptor
    Link(Uuid),
    /// Compose-engine component payload
    Component(Uuid),
    /// Compose-engine interface payload
    Interface { role: String, binding: Uuid },
}

impl StateKey {
    /// Parse a wire key; None for keys this controller does not recognize.
    pub fn parse(key: &str) -> Option<StateKey> {
        // accessstatus must be tested before access: shared prefix
        if let Some(rest) = key.strip_prefix("accessstatus-") {
            return Uuid::parse_str(rest).ok().map(StateKey::AccessStatus);
        }
        if let Some(rest) = key.strip_prefix("tls-site-") {
            return Uuid::parse_str(rest).ok().map(StateKey::TlsSite);
        }
        if let Some(rest) = key.strip_prefix("tls-server-") {
            return Uuid::parse_str(rest).ok().map(StateKey::TlsServer);
        }
        if let Some(rest) = key.strip_prefix("access-") {
            return Uuid::parse_str(rest).ok().map(StateKey::Access);
        }
        if let Some(rest) = key.strip_prefix("link-") {
            return Uuid::parse_str(rest).ok().map(StateKey::Link);
        }
        if let Some(rest) = key.strip_prefix("component-") {
            return Uuid::parse_str(rest).ok().map(StateKey::Component);
        }
        if let Some(rest) = key.strip_prefix("iface-") {
            // The role is the leading segment; the remainder is the full
            // hyphenated UUID.
            let (role, id) = rest.split_once('-')?;
            return Uuid::parse_str(id).ok().map(|binding| StateKey::Interface {
                role: role.to_string(),
                binding,
            });
        }
        None
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKey::TlsSite(id) => write!(f, "tls-site-{id}"),
            StateKey::TlsServer(id) => write!(f, "tls-server-{id}"),
            StateKey::Access(id) => write!(f, "access-{id}"),
            StateKey::AccessStatus(id) => write!(f, "accessstatus-{id}"),
            StateKey::Link(id) => write!(f, "link-{id}"),
            StateKey::Component(id) => write!(f, "component-{id}"),
            StateKey::Interface { role, binding } => write!(f, "iface-{role}-{binding}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        let id = Uuid::new_v4();
        for key in [
            StateKey::TlsSite(id),
            StateKey::TlsServer(id),
            StateKey::Access(id),
            StateKey::AccessStatus(id),
            StateKey::Link(id),
            StateKey::Component(id),
            StateKey::Interface {
                role: "http".into(),
                binding: id,
            },
        ] {
            assert_eq!(StateKey::parse(&key.to_string()), Some(key));
        }
    }

    #[test]
    fn accessstatus_is_not_parsed_as_access() {
        let id = Uuid::new_v4();
        let parsed = StateKey::parse(&format!("accessstatus-{id}"));
        assert_eq!(parsed, Some(StateKey::AccessStatus(id)));
    }

    #[test]
    fn unknown_keys_are_none() {
        assert_eq!(StateKey::parse("mystery-42"), None);
        assert_eq!(StateKey::parse("tls-site-not-a-uuid"), None);
    }
}
