use std::net::{SocketAddr, TcpListener};

/// Reserves `n` distinct loopback addresses allocated by the OS.
///
/// Every listener is held until all addresses are known, so the OS cannot
/// hand out the same port twice within one call.
pub fn get_unused_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("Bind an ephemeral port"))
        .collect::<Vec<_>>();

    listeners
        .iter()
        .map(|listener| listener.local_addr().expect("Read the bound address"))
        .collect()
}

/// Gets a new loopback address allocated by the OS.
pub fn get_unused_addr() -> SocketAddr {
    get_unused_addrs(1)[0]
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn test_unused_addrs_are_distinct() {
        let addrs = get_unused_addrs(4);
        let ports = addrs.iter().map(SocketAddr::port).collect::<BTreeSet<_>>();
        assert_eq!(ports.len(), 4);
        assert!(addrs.iter().all(|addr| addr.ip().is_loopback()));

        TcpListener::bind(get_unused_addr()).expect("Bind the released address");
    }
}
