//! Owned OS descriptors.
//!
//! Adoption takes ownership of an already-open descriptor. [`Descriptor`]
//! carries the raw fd tagged by kind and closes it exactly once, either when
//! the owning slot is torn down or when an adoption fails before a slot
//! exists (the wrapper is simply dropped).

use std::fs::File;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

/// The kind of descriptor being adopted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// A connected stream socket (TCP or unix stream).
    Stream,
    /// A datagram socket.
    Udp,
    /// A plain file descriptor (pipe, character device, regular file).
    File,
}

/// An owned OS descriptor awaiting, or bound to, a connection slot.
#[derive(Debug)]
pub struct Descriptor {
    kind: DescriptorKind,
    fd: RawFd,
}

impl Descriptor {
    /// Wrap a raw descriptor. Takes ownership; the fd is closed on drop.
    pub fn from_raw(kind: DescriptorKind, fd: RawFd) -> Self {
        Self { kind, fd }
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self::from_raw(DescriptorKind::Stream, stream.into_raw_fd())
    }

    pub fn from_udp(socket: UdpSocket) -> Self {
        Self::from_raw(DescriptorKind::Udp, socket.into_raw_fd())
    }

    pub fn from_file(file: File) -> Self {
        Self::from_raw(DescriptorKind::File, file.into_raw_fd())
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    /// Socket descriptors (stream or datagram) are subject to peer
    /// admission control; file descriptors are not.
    pub fn is_socket(&self) -> bool {
        matches!(self.kind, DescriptorKind::Stream | DescriptorKind::Udp)
    }

    /// Put the descriptor into nonblocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Remote address of a connected socket. `None` for files and for
    /// sockets with no peer (unconnected datagram sockets).
    pub fn peer_addr(&self) -> Option<IpAddr> {
        if !self.is_socket() {
            return None;
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return None;
        }
        sockaddr_to_std(&storage, len).ok().map(|addr| addr.ip())
    }

    /// Local address the descriptor is bound to, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if !self.is_socket() {
            return None;
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return None;
        }
        sockaddr_to_std(&storage, len).ok()
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }
}

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

/// Create a datagram socket for a local wildcard address on `port`,
/// optionally binding it. Candidate addresses are tried v6 first, then v4,
/// taking the first family for which a socket can be created.
pub(crate) fn create_udp_socket(port: u16, bind: bool) -> io::Result<Descriptor> {
    let candidates: [SocketAddr; 2] = [
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)),
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
    ];

    let mut last_err = io::Error::new(io::ErrorKind::Other, "no usable address family");
    for addr in candidates {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            last_err = io::Error::last_os_error();
            continue;
        }
        let desc = Descriptor::from_raw(DescriptorKind::Udp, fd);
        if bind {
            bind_socket(fd, &addr)?;
        }
        return Ok(desc);
    }

    Err(last_err)
}

fn bind_socket(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = sockaddr_from_std(addr);
    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Convert a libc sockaddr_storage to a Rust SocketAddr.
pub(crate) fn sockaddr_to_std(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            if len < mem::size_of::<libc::sockaddr_in>() as libc::socklen_t {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "address too short",
                ));
            }
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            if len < mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "address too short",
                ));
            }
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Convert a Rust SocketAddr to a libc sockaddr_storage.
fn sockaddr_from_std(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn stream_descriptor_kind() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let _client = client;

        let desc = Descriptor::from_stream(server);
        assert_eq!(desc.kind(), DescriptorKind::Stream);
        assert!(desc.is_socket());
    }

    #[test]
    fn connected_stream_has_peer_addr() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let _client = client;

        let desc = Descriptor::from_stream(server);
        assert_eq!(desc.peer_addr(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn file_descriptor_has_no_peer() {
        let file = File::open("/dev/null").unwrap();
        let desc = Descriptor::from_file(file);
        assert_eq!(desc.kind(), DescriptorKind::File);
        assert!(!desc.is_socket());
        assert_eq!(desc.peer_addr(), None);
    }

    #[test]
    fn set_nonblocking_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let _client = client;

        let desc = Descriptor::from_stream(server);
        desc.set_nonblocking().unwrap();
        let flags = unsafe { libc::fcntl(desc.raw(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
    }

    #[test]
    fn udp_socket_bound_and_unbound() {
        let bound = create_udp_socket(0, true).unwrap();
        let addr = bound.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let unbound = create_udp_socket(0, false).unwrap();
        let addr = unbound.local_addr().unwrap();
        assert_eq!(addr.port(), 0);
    }

    #[test]
    fn drop_closes_fd() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let _client = client;

        let fd = server.as_raw_fd();
        let desc = Descriptor::from_stream(server);
        drop(desc);
        let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(rc, -1);
    }
}
