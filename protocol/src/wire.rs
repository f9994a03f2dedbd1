//! Length-prefixed binary codec over unix sockets.
//!
//! Scalars travel in native endianness, strings as a usize length followed
//! by raw bytes. File descriptors ride as SCM_RIGHTS ancillary data on a
//! one-byte carrier message.

use std::io::{Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use anyhow::{Result, bail};
use core::ffi::c_void;

pub trait UnixStreamExt {
    fn read_u8(&mut self) -> Result<u8>;
    fn read_u32(&mut self) -> Result<u32>;
    fn read_usize(&mut self) -> Result<usize>;
    fn read_string(&mut self) -> Result<String>;
    fn write_u8(&mut self, value: u8) -> Result<()>;
    fn write_u32(&mut self, value: u32) -> Result<()>;
    fn write_usize(&mut self, value: usize) -> Result<()>;
    fn write_string(&mut self, value: &str) -> Result<()>;
    fn recv_fd(&mut self) -> Result<OwnedFd>;
    fn send_fd(&mut self, fd: RawFd) -> Result<()>;
}

impl UnixStreamExt for UnixStream {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    fn read_usize(&mut self) -> Result<usize> {
        let mut buf = [0u8; mem::size_of::<usize>()];
        self.read_exact(&mut buf)?;
        Ok(usize::from_ne_bytes(buf))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_usize()?;
        // A daemon answering with a bogus length must not make the zygote
        // allocate unbounded memory.
        if len > 0x10000 {
            bail!("string length {len} exceeds protocol limit");
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&value.to_ne_bytes())?;
        Ok(())
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_ne_bytes())?;
        Ok(())
    }

    fn write_usize(&mut self, value: usize) -> Result<()> {
        self.write_all(&value.to_ne_bytes())?;
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_usize(value.len())?;
        self.write_all(value.as_bytes())?;
        Ok(())
    }

    fn recv_fd(&mut self) -> Result<OwnedFd> {
        let mut carrier = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: carrier.as_mut_ptr() as *mut c_void,
            iov_len: 1,
        };
        // u64 array keeps the control buffer aligned for cmsghdr.
        let mut cmsg_space = [0u64; 8];

        unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_space.as_mut_ptr() as *mut c_void;
            msg.msg_controllen = mem::size_of_val(&cmsg_space);

            let n = libc::recvmsg(self.as_raw_fd(), &mut msg, 0);
            if n <= 0 {
                bail!("recvmsg: {}", std::io::Error::last_os_error());
            }

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null()
                || (*cmsg).cmsg_level != libc::SOL_SOCKET
                || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            {
                bail!("no file descriptor in ancillary data");
            }
            let fd = *(libc::CMSG_DATA(cmsg) as *const RawFd);
            if fd < 0 {
                bail!("received invalid file descriptor");
            }
            Ok(OwnedFd::from_raw_fd(fd))
        }
    }

    fn send_fd(&mut self, fd: RawFd) -> Result<()> {
        let mut carrier = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: carrier.as_mut_ptr() as *mut c_void,
            iov_len: 1,
        };
        let mut cmsg_space = [0u64; 8];

        unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_space.as_mut_ptr() as *mut c_void;
            msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
            *(libc::CMSG_DATA(cmsg) as *mut RawFd) = fd;

            if libc::sendmsg(self.as_raw_fd(), &msg, 0) < 0 {
                bail!("sendmsg: {}", std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}
