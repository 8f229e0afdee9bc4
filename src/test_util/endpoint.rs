use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// convenience method for unit test code: create an endpoint based on a number, the same number
///  generating the same endpoint and different numbers different endpoints
pub fn test_endpoint_from_number(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// the simulated multicast group that unit tests use unless they need something specific
pub fn test_group_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 12), 24680))
}
