//! Delivery planning: which path each BLE peer gets, and which UDP destinations a batch goes to.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Roles in which a remote BLE device is currently linked to us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkRoles {
    /// We hold a central-role (GATT client) connection to the remote.
    pub central: bool,
    /// The remote is connected to our peripheral role (GATT server).
    pub peripheral: bool,
}

impl LinkRoles {
    pub fn is_linked(&self) -> bool {
        self.central || self.peripheral
    }
}

/// How chunks reach one BLE peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryPath {
    /// Characteristic write over our central-role connection.
    Write,
    /// Characteristic notification from our peripheral role.
    Notify,
}

/// Choose exactly one path per linked peer: write when we are central, otherwise notify.
/// Peers with no live link are skipped. Output is sorted by address.
pub fn plan_ble_delivery<'a, I>(links: I) -> Vec<(String, DeliveryPath)>
where
    I: IntoIterator<Item = (&'a String, &'a LinkRoles)>,
{
    let mut out: Vec<(String, DeliveryPath)> = links
        .into_iter()
        .filter_map(|(addr, roles)| {
            let path = if roles.central {
                DeliveryPath::Write
            } else if roles.peripheral {
                DeliveryPath::Notify
            } else {
                return None;
            };
            Some((addr.clone(), path))
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// UDP fan-out list: broadcast first, then every learned peer, then the relay if allowed.
pub fn udp_destinations(
    broadcast: SocketAddr,
    peers: &HashMap<IpAddr, SocketAddr>,
    relay: Option<SocketAddr>,
) -> Vec<SocketAddr> {
    let mut out = Vec::with_capacity(peers.len() + 2);
    out.push(broadcast);
    let mut learned: Vec<SocketAddr> = peers.values().copied().collect();
    learned.sort();
    out.extend(learned);
    if let Some(relay) = relay {
        out.push(relay);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn roles(central: bool, peripheral: bool) -> LinkRoles {
        LinkRoles {
            central,
            peripheral,
        }
    }

    #[test]
    fn plan_empty_links() {
        let links: HashMap<String, LinkRoles> = HashMap::new();
        assert!(plan_ble_delivery(&links).is_empty());
    }

    #[test]
    fn central_link_wins_over_peripheral() {
        let mut links = HashMap::new();
        links.insert("both".to_string(), roles(true, true));
        links.insert("client".to_string(), roles(true, false));
        links.insert("server".to_string(), roles(false, true));
        let plan = plan_ble_delivery(&links);
        assert_eq!(
            plan,
            vec![
                ("both".to_string(), DeliveryPath::Write),
                ("client".to_string(), DeliveryPath::Write),
                ("server".to_string(), DeliveryPath::Notify),
            ]
        );
    }

    #[test]
    fn unlinked_peer_skipped() {
        let mut links = HashMap::new();
        links.insert("gone".to_string(), roles(false, false));
        assert!(plan_ble_delivery(&links).is_empty());
    }

    #[test]
    fn udp_destinations_order() {
        let broadcast = SocketAddr::from((Ipv4Addr::BROADCAST, 45678));
        let mut peers = HashMap::new();
        let p1 = SocketAddr::from(([192, 168, 1, 20], 45678));
        let p2 = SocketAddr::from(([192, 168, 1, 10], 45678));
        peers.insert(p1.ip(), p1);
        peers.insert(p2.ip(), p2);
        let relay = SocketAddr::from(([203, 0, 113, 5], 40100));
        let out = udp_destinations(broadcast, &peers, Some(relay));
        assert_eq!(out, vec![broadcast, p2, p1, relay]);
    }

    #[test]
    fn udp_destinations_without_relay() {
        let broadcast = SocketAddr::from((Ipv4Addr::BROADCAST, 45678));
        let out = udp_destinations(broadcast, &HashMap::new(), None);
        assert_eq!(out, vec![broadcast]);
    }
}
