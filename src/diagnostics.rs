//! Topology inference over the discovered chain.

use crate::error::{ConfigError, Error};
use crate::slave::Slave;
use std::collections::BTreeMap;

/// Infer the wiring topology from each device's open port count.
///
/// Call after the DL status of every device has been refreshed. Returns a map from configured
/// address to the address of the upstream parent; the only device that is its own parent hangs
/// off the master. A device with no open port cannot be part of the chain and is rejected.
///
/// Walking the chain in discovery order: a device with one open port ends a line and processing
/// returns to the most recent junction, a device with two ports passes through, and a device
/// with more than two ports opens one branch per extra port.
pub fn get_topology(slaves: &[Slave]) -> Result<BTreeMap<u16, u16>, Error> {
    let mut topology = BTreeMap::new();

    let Some(first) = slaves.first() else {
        return Ok(topology);
    };

    let mut last_seen = first.configured_address;
    let mut branches: Vec<u16> = Vec::new();

    for slave in slaves {
        let open_ports = slave.count_open_ports();

        match open_ports {
            0 => return Err(Error::Config(ConfigError::ZeroOpenPorts)),
            1 => {
                topology.insert(slave.configured_address, last_seen);

                last_seen = match branches.pop() {
                    Some(junction) => junction,
                    None => slave.configured_address,
                };
            }
            2 => {
                topology.insert(slave.configured_address, last_seen);

                last_seen = slave.configured_address;
            }
            _ => {
                topology.insert(slave.configured_address, last_seen);

                last_seen = slave.configured_address;

                for _ in 2..open_ports {
                    branches.push(slave.configured_address);
                }
            }
        }
    }

    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dl_status::DlStatus;
    use pretty_assertions::assert_eq;

    fn chain(open_ports: &[u8]) -> Vec<Slave> {
        open_ports
            .iter()
            .enumerate()
            .map(|(position, ports)| {
                let mut slave = Slave::new(position as u16);

                slave.dl_status = DlStatus::with_open_ports(*ports);

                slave
            })
            .collect()
    }

    fn map(parents: &[u16]) -> BTreeMap<u16, u16> {
        parents
            .iter()
            .enumerate()
            .map(|(address, parent)| (address as u16, *parent))
            .collect()
    }

    #[test]
    fn line() {
        // 0 - 1 - 2 - 3 - 4
        let slaves = chain(&[2, 2, 2, 2, 1]);

        assert_eq!(get_topology(&slaves).unwrap(), map(&[0, 0, 1, 2, 3]));
    }

    #[test]
    fn single_branch() {
        // 0 - 1 - 2 - 3
        //     |
        //     4
        let slaves = chain(&[2, 3, 2, 1, 1]);

        assert_eq!(get_topology(&slaves).unwrap(), map(&[0, 0, 1, 2, 1]));
    }

    #[test]
    fn multiple_branches() {
        // 0 - 1 - 2
        // |   |
        // 4   3
        let slaves = chain(&[3, 3, 1, 1, 1]);

        assert_eq!(get_topology(&slaves).unwrap(), map(&[0, 0, 1, 1, 0]));
    }

    #[test]
    fn lone_slave_rejected() {
        // 0 - 1 - 2 - 3    4
        let slaves = chain(&[2, 2, 2, 1, 0]);

        assert_eq!(
            get_topology(&slaves),
            Err(Error::Config(ConfigError::ZeroOpenPorts))
        );
    }

    #[test]
    fn empty_chain() {
        assert!(get_topology(&[]).unwrap().is_empty());
    }
}
