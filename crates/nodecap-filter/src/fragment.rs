// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Filter expression fragments and their tcpdump rendering.
// Author: Lukas Bower

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::protocol::TransportProtocol;

/// Separator used when joining fragments into a capture filter.
pub const FRAGMENT_SEPARATOR: &str = " and ";

/// A single capture filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "predicate", rename_all = "kebab-case")]
pub enum FilterFragment {
    /// Traffic sent or received by the address.
    Host {
        /// Endpoint address.
        ip: IpAddr,
    },
    /// Traffic sent by the address.
    Src {
        /// Endpoint address.
        ip: IpAddr,
    },
    /// Traffic received by the address.
    Dst {
        /// Endpoint address.
        ip: IpAddr,
    },
    /// Traffic on a transport port.
    Port {
        /// Transport protocol carrying the port.
        transport: TransportProtocol,
        /// Port number.
        port: u16,
    },
}

impl FilterFragment {
    /// Return the endpoint address referenced by the fragment, if any.
    #[must_use]
    pub fn address(&self) -> Option<IpAddr> {
        match self {
            Self::Host { ip } | Self::Src { ip } | Self::Dst { ip } => Some(*ip),
            Self::Port { .. } => None,
        }
    }
}

impl fmt::Display for FilterFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host { ip } => write!(f, "host {ip}"),
            Self::Src { ip } => write!(f, "src {ip}"),
            Self::Dst { ip } => write!(f, "dst {ip}"),
            Self::Port {
                transport: TransportProtocol::Tcp,
                port,
            } => write!(f, "tcp port {port}"),
            Self::Port {
                transport: TransportProtocol::Udp,
                port,
            } => write!(f, "udp port {port}"),
            Self::Port {
                transport: TransportProtocol::TcpOrUdp,
                port,
            } => write!(f, "(tcp port {port} or udp port {port})"),
        }
    }
}

/// Render fragments as a single capture filter; no fragments captures everything.
#[must_use]
pub fn join_fragments(fragments: &[FilterFragment]) -> String {
    fragments
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(FRAGMENT_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn either_transport_keeps_both_protocols() {
        let fragment = FilterFragment::Port {
            transport: TransportProtocol::TcpOrUdp,
            port: 53,
        };
        assert_eq!(fragment.to_string(), "(tcp port 53 or udp port 53)");
        assert_eq!(fragment.address(), None);
    }

    #[test]
    fn join_uses_logical_and() {
        let ip: IpAddr = "10.244.1.7".parse().unwrap();
        let joined = join_fragments(&[
            FilterFragment::Src { ip },
            FilterFragment::Port {
                transport: TransportProtocol::Tcp,
                port: 443,
            },
        ]);
        assert_eq!(joined, "src 10.244.1.7 and tcp port 443");
        assert_eq!(join_fragments(&[]), "");
    }
}
