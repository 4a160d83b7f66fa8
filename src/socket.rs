//! Byte level access to the wire.
//!
//! The rest of the crate only sees the [`RawSocket`] capability set; the two concrete variants
//! are the AF_PACKET socket bound to the EtherCAT EtherType and a null socket standing in for an
//! absent redundant interface.

use crate::error::Error;
use crate::ETHERCAT_ETHERTYPE;
use core::time::Duration;

/// Blocking/non-blocking byte access to one Ethernet interface.
pub trait RawSocket {
    fn open(&mut self, interface: &str) -> Result<(), Error>;

    /// Deadline for [`read`](Self::read). `None` blocks forever.
    fn set_timeout(&mut self, timeout: Option<Duration>);

    fn close(&mut self);

    /// Read one frame. Returns the number of bytes read, `Ok(0)` when the interface has nothing
    /// to offer (null socket), or [`Error::Timeout`] when the deadline passed first.
    fn read(&mut self, frame: &mut [u8]) -> Result<usize, Error>;

    /// Write one frame, returning the number of bytes written.
    fn write(&mut self, frame: &[u8]) -> Result<usize, Error>;
}

/// An absent interface, so the link can run without redundancy.
///
/// Reads yield nothing and writes claim full success.
#[derive(Debug, Default)]
pub struct NullSocket;

impl RawSocket for NullSocket {
    fn open(&mut self, _interface: &str) -> Result<(), Error> {
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    fn close(&mut self) {}

    fn read(&mut self, _frame: &mut [u8]) -> Result<usize, Error> {
        Ok(0)
    }

    fn write(&mut self, frame: &[u8]) -> Result<usize, Error> {
        Ok(frame.len())
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::EthercatSocket;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    fn errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    /// AF_PACKET socket bound to one interface, filtered to the EtherCAT EtherType.
    ///
    /// Needs CAP_NET_RAW. The file descriptor runs non-blocking; read deadlines are enforced with
    /// `poll(2)`.
    #[derive(Debug)]
    pub struct EthercatSocket {
        fd: libc::c_int,
        timeout: Option<Duration>,
    }

    impl Default for EthercatSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EthercatSocket {
        pub fn new() -> Self {
            Self {
                fd: -1,
                timeout: None,
            }
        }

        /// Open and bind in one step.
        pub fn open_interface(interface: &str) -> Result<Self, Error> {
            let mut socket = Self::new();

            socket.open(interface)?;

            Ok(socket)
        }
    }

    impl RawSocket for EthercatSocket {
        fn open(&mut self, interface: &str) -> Result<(), Error> {
            let protocol = ETHERCAT_ETHERTYPE.to_be();

            let fd = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                    libc::c_int::from(protocol),
                )
            };

            if fd < 0 {
                return Err(Error::Io(errno()));
            }

            let ifindex = nix::net::if_::if_nametoindex(interface).map_err(|e| {
                unsafe { libc::close(fd) };

                Error::Io(e as i32)
            })?;

            let mut addr: libc::sockaddr_ll = unsafe { core::mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as u16;
            addr.sll_protocol = protocol;
            addr.sll_ifindex = ifindex as i32;

            let rc = unsafe {
                libc::bind(
                    fd,
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    core::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };

            if rc < 0 {
                let e = errno();

                unsafe { libc::close(fd) };

                return Err(Error::Io(e));
            }

            // The master must also see frames addressed to the broadcast MAC it did not send.
            let mreq = libc::packet_mreq {
                mr_ifindex: ifindex as i32,
                mr_type: libc::PACKET_MR_PROMISC as u16,
                mr_alen: 0,
                mr_address: [0; 8],
            };

            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_PACKET,
                    libc::PACKET_ADD_MEMBERSHIP,
                    &mreq as *const libc::packet_mreq as *const libc::c_void,
                    core::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
                )
            };

            if rc < 0 {
                let e = errno();

                unsafe { libc::close(fd) };

                return Err(Error::Io(e));
            }

            log::debug!("opened {} (ifindex {})", interface, ifindex);

            self.fd = fd;

            Ok(())
        }

        fn set_timeout(&mut self, timeout: Option<Duration>) {
            self.timeout = timeout;
        }

        fn close(&mut self) {
            if self.fd >= 0 {
                unsafe { libc::close(self.fd) };

                self.fd = -1;
            }
        }

        fn read(&mut self, frame: &mut [u8]) -> Result<usize, Error> {
            let mut pollfd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            };

            let timeout_ms = match self.timeout {
                Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
                None => -1,
            };

            let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

            if ready < 0 {
                return Err(Error::Io(errno()));
            }

            if ready == 0 {
                return Err(Error::Timeout);
            }

            let read = unsafe {
                libc::recv(
                    self.fd,
                    frame.as_mut_ptr() as *mut libc::c_void,
                    frame.len(),
                    0,
                )
            };

            if read < 0 {
                return Err(Error::Io(errno()));
            }

            Ok(read as usize)
        }

        fn write(&mut self, frame: &[u8]) -> Result<usize, Error> {
            let written = unsafe {
                libc::send(
                    self.fd,
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                )
            };

            if written < 0 {
                return Err(Error::Io(errno()));
            }

            Ok(written as usize)
        }
    }

    impl Drop for EthercatSocket {
        fn drop(&mut self) {
            self.close();
        }
    }
}
