// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Application-layer protocol to transport/port mapping for capture filters.
// Author: Lukas Bower

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{FilterError, FilterFragment};

/// Transport protocol carrying an application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportProtocol {
    /// TCP only.
    Tcp,
    /// UDP only.
    Udp,
    /// Served over both TCP and UDP.
    TcpOrUdp,
}

impl TransportProtocol {
    /// Render the canonical label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::TcpOrUdp => "tcp-or-udp",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportProtocol {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "tcp-or-udp" | "any" => Ok(Self::TcpOrUdp),
            other => Err(FilterError::UnknownTransport(other.to_owned())),
        }
    }
}

/// Application-layer protocol selection for a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "UPPERCASE")]
pub enum ApplicationProtocol {
    /// HTTP over TCP port 80.
    Http,
    /// HTTPS over TCP port 443.
    Https,
    /// DNS over TCP or UDP port 53.
    Dns,
    /// SSH over TCP port 22.
    Ssh,
    /// NTP over UDP port 123.
    Ntp,
    /// Operator-supplied transport and port.
    Custom {
        /// Transport protocol.
        transport: TransportProtocol,
        /// Port number.
        port: u16,
    },
}

impl ApplicationProtocol {
    /// Protocols offered by name.
    pub const NAMED: [ApplicationProtocol; 5] = [
        ApplicationProtocol::Http,
        ApplicationProtocol::Https,
        ApplicationProtocol::Dns,
        ApplicationProtocol::Ssh,
        ApplicationProtocol::Ntp,
    ];

    /// Return the transport carrying this protocol.
    #[must_use]
    pub fn transport(&self) -> TransportProtocol {
        match self {
            Self::Http | Self::Https | Self::Ssh => TransportProtocol::Tcp,
            Self::Ntp => TransportProtocol::Udp,
            Self::Dns => TransportProtocol::TcpOrUdp,
            Self::Custom { transport, .. } => *transport,
        }
    }

    /// Return the well-known or configured port.
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
            Self::Dns => 53,
            Self::Ssh => 22,
            Self::Ntp => 123,
            Self::Custom { port, .. } => *port,
        }
    }

    /// Return the filter fragment matching this protocol.
    #[must_use]
    pub fn fragment(&self) -> FilterFragment {
        FilterFragment::Port {
            transport: self.transport(),
            port: self.port(),
        }
    }
}

impl fmt::Display for ApplicationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("HTTP"),
            Self::Https => f.write_str("HTTPS"),
            Self::Dns => f.write_str("DNS"),
            Self::Ssh => f.write_str("SSH"),
            Self::Ntp => f.write_str("NTP"),
            Self::Custom { transport, port } => write!(f, "{transport}/{port}"),
        }
    }
}

impl FromStr for ApplicationProtocol {
    type Err = FilterError;

    /// Accepts a protocol name (`dns`) or `<transport>/<port>` (`udp/5353`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Some((transport, port)) = trimmed.split_once('/') {
            let transport = transport.parse::<TransportProtocol>()?;
            let port = port
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| FilterError::InvalidPort(port.trim().to_owned()))?;
            return Ok(Self::Custom { transport, port });
        }
        Self::NAMED
            .iter()
            .find(|protocol| protocol.to_string().eq_ignore_ascii_case(trimmed))
            .copied()
            .ok_or_else(|| FilterError::UnknownProtocol(trimmed.to_owned()))
    }
}
