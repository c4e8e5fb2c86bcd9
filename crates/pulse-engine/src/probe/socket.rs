//! Probe socket construction.
//!
//! One unconnected IPv4 UDP socket serves a whole run: non-blocking during
//! dispatch, flipped to blocking with a read timeout for the drain phase.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Requested send and receive buffer size. A busy run can have hundreds of
/// responses land between recv calls; the kernel may grant less.
const PROBE_BUFFER_BYTES: usize = 65535;

/// Create the run socket: bound to 0.0.0.0:0, non-blocking, with generous
/// buffers. Buffer shortfall is logged, never fatal.
pub(crate) fn bind_probe_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    request_buffer(&socket, "send", PROBE_BUFFER_BYTES, |s, n| s.set_send_buffer_size(n), |s| {
        s.send_buffer_size()
    });
    request_buffer(&socket, "recv", PROBE_BUFFER_BYTES, |s, n| s.set_recv_buffer_size(n), |s| {
        s.recv_buffer_size()
    });

    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&bind_addr.into())?;

    #[cfg(windows)]
    disable_connreset(&socket)?;

    Ok(socket.into())
}

fn request_buffer(
    socket: &Socket,
    direction: &str,
    wanted: usize,
    set: impl Fn(&Socket, usize) -> std::io::Result<()>,
    get: impl Fn(&Socket) -> std::io::Result<usize>,
) {
    if let Err(e) = set(socket, wanted) {
        tracing::warn!(direction, error = %e, "failed to set socket buffer size");
        return;
    }
    match get(socket) {
        Ok(granted) if granted < wanted => {
            tracing::debug!(direction, wanted, granted, "kernel granted a smaller buffer");
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(direction, error = %e, "could not read back buffer size"),
    }
}

/// Stop Winsock from surfacing ICMP port-unreachable as an error on later
/// recvs. A transient endpoint must not poison the shared run socket.
#[cfg(windows)]
fn disable_connreset(socket: &Socket) -> std::io::Result<()> {
    use std::os::windows::io::AsRawSocket;
    use windows_sys::Win32::Networking::WinSock::{SIO_UDP_CONNRESET, SOCKET_ERROR, WSAIoctl};

    let enable: u32 = 0;
    let mut bytes_returned: u32 = 0;
    // Safety: in/out buffers are valid for the lengths passed and no
    // overlapped structure or completion routine is supplied.
    let rc = unsafe {
        WSAIoctl(
            socket.as_raw_socket() as usize,
            SIO_UDP_CONNRESET,
            &enable as *const u32 as *const _,
            std::mem::size_of::<u32>() as u32,
            std::ptr::null_mut(),
            0,
            &mut bytes_returned,
            std::ptr::null_mut(),
            None,
        )
    };
    if rc == SOCKET_ERROR {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
