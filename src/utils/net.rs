use std::collections::HashSet;
use std::net::TcpListener;
use std::time::{SystemTime, UNIX_EPOCH};

const PORT_RANGE_START: u16 = 20000;
const PORT_RANGE_END: u16 = 60000;

/// Find an unoccupied localhost port for an SSH forward.
pub fn find_free_port() -> Option<u16> {
    find_free_port_with_exclusions(&HashSet::new())
}

/// Find an unoccupied localhost port that is also not in `excluded`.
///
/// `excluded` carries ports already promised to other VMs whose hypervisor
/// is not currently listening on them.
pub fn find_free_port_with_exclusions(excluded: &HashSet<u16>) -> Option<u16> {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let span = (PORT_RANGE_END - PORT_RANGE_START) as u64;
    let start = PORT_RANGE_START + (seed % span) as u16;

    tracing::debug!("searching for free port from {} (excluding {:?})", start, excluded);

    let port = (start..PORT_RANGE_END)
        .chain(PORT_RANGE_START..start)
        .filter(|port| !excluded.contains(port))
        .find(|port| is_port_available(*port));

    match port {
        Some(port) => tracing::debug!("found free port {}", port),
        None => tracing::warn!("no free ports in {}-{}", PORT_RANGE_START, PORT_RANGE_END - 1),
    }
    port
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_bound_and_excluded_ports() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let held_port = held.local_addr().unwrap().port();

        let mut excluded = HashSet::new();
        excluded.insert(held_port.wrapping_add(1));

        let port = find_free_port_with_exclusions(&excluded).unwrap();
        assert_ne!(port, held_port);
        assert!(!excluded.contains(&port));
        assert!((PORT_RANGE_START..PORT_RANGE_END).contains(&port));
    }
}
