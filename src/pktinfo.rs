//! `IP_PKTINFO` helpers for the wildcard UDP listener.
//!
//! A wildcard socket must learn which local address each query was sent to
//! (for the interface allow-list) and answer from that same address.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;

use socket2::Socket;

/// Control-message buffer aligned for `cmsghdr` access.
#[repr(C, align(8))]
struct CmsgBuf<const N: usize>([u8; N]);

impl<const N: usize> CmsgBuf<N> {
    fn new() -> Self {
        Self([0; N])
    }

    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.0.as_mut_ptr() as *mut libc::c_void
    }
}

/// Ask the kernel to report the destination address of received packets.
///
/// # Returns
/// An error when the platform cannot provide the information, in which case
/// wildcard binding is not usable.
pub fn enable_pktinfo(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let val: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one datagram along with its destination address.
///
/// # Returns
/// Bytes read, the sender, and the local address the packet was sent to.
pub fn recv_with_pktinfo(
    socket: &std::net::UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, IpAddr)> {
    let fd = socket.as_raw_fd();
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut src_addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut cmsg_buf = CmsgBuf::<128>::new();
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src_addr as *mut libc::sockaddr_in as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr();
    msg.msg_controllen = cmsg_buf.0.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let from = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::from(u32::from_be(src_addr.sin_addr.s_addr))),
        u16::from_be(src_addr.sin_port),
    );
    let dst = destination(&msg).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    Ok((n as usize, from, dst))
}

fn destination(msg: &libc::msghdr) -> Option<IpAddr> {
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::IPPROTO_IP && header.cmsg_type == libc::IP_PKTINFO {
            let info = unsafe { (libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo).read_unaligned() };
            return Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr))));
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    None
}

/// Send one datagram with a chosen source address.
///
/// Falls back to a plain `send_to` for IPv6 or an unspecified source.
pub fn send_from(
    socket: &std::net::UdpSocket,
    buf: &[u8],
    to: SocketAddr,
    src: IpAddr,
) -> io::Result<()> {
    let (IpAddr::V4(src_v4), SocketAddr::V4(to_v4)) = (src, to) else {
        return socket.send_to(buf, to).map(|_| ());
    };
    if src_v4.is_unspecified() {
        return socket.send_to(buf, to).map(|_| ());
    }

    let fd = socket.as_raw_fd();
    let mut dst_addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    dst_addr.sin_family = libc::AF_INET as libc::sa_family_t;
    dst_addr.sin_addr.s_addr = u32::from(*to_v4.ip()).to_be();
    dst_addr.sin_port = to_v4.port().to_be();

    let pktinfo = libc::in_pktinfo {
        ipi_ifindex: 0,
        ipi_spec_dst: libc::in_addr {
            s_addr: u32::from(src_v4).to_be(),
        },
        ipi_addr: libc::in_addr { s_addr: 0 },
    };

    let cmsg_space =
        unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::in_pktinfo>() as u32) } as usize;
    let mut cmsg_buf = CmsgBuf::<64>::new();

    let iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut dst_addr as *mut libc::sockaddr_in as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr();
    msg.msg_controllen = cmsg_space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return socket.send_to(buf, to).map(|_| ());
        }
        (*cmsg).cmsg_level = libc::IPPROTO_IP;
        (*cmsg).cmsg_type = libc::IP_PKTINFO;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<libc::in_pktinfo>() as u32) as _;
        (libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo).write_unaligned(pktinfo);
    }

    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Duration;

    #[test]
    fn control_buffers_fit_cmsghdr_alignment() {
        let align = std::mem::align_of::<libc::cmsghdr>();
        assert!(std::mem::align_of::<CmsgBuf<128>>() >= align);
        assert!(std::mem::align_of::<CmsgBuf<64>>() >= align);
        let mut buf = CmsgBuf::<64>::new();
        assert_eq!(buf.as_mut_ptr() as usize % align, 0);
    }

    #[test]
    fn loopback_destination_is_reported_and_answered_from() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None).unwrap();
        enable_pktinfo(&socket).unwrap();
        socket.bind(&addr.into()).unwrap();
        let server: UdpSocket = socket.into();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.send_to(b"ping", server.local_addr().unwrap()).unwrap();

        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        let (n, from, dst) = loop {
            match recv_with_pktinfo(&server, &mut buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                other => break other.unwrap(),
            }
        };
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, client.local_addr().unwrap());
        assert_eq!(dst, IpAddr::V4(Ipv4Addr::LOCALHOST));

        send_from(&server, b"pong", from, dst).unwrap();
        let (n, reply_from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(reply_from, server.local_addr().unwrap());
    }
}
