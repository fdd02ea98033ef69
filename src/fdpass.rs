// src/fdpass.rs

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Upper bound on fds per message; the ring handshake sends three.
pub const MAX_FDS: usize = 4;

#[repr(C)]
union CmsgBuf {
    buf: [u8; 128],
    _align: libc::cmsghdr,
}

/// Send `payload` plus the given fds as SCM_RIGHTS ancillary data in a
/// single message.
pub fn send_fds(sock: &UnixStream, fds: &[RawFd], payload: &[u8]) -> io::Result<()> {
    assert!(fds.len() <= MAX_FDS);
    assert!(!payload.is_empty(), "ancillary data needs at least one byte");

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let fd_bytes = mem::size_of_val(fds);
    let mut cmsg_buf = CmsgBuf { buf: [0u8; 128] };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    unsafe {
        msg.msg_control = cmsg_buf.buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(fd_bytes as u32) as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr() as *const u8,
            libc::CMSG_DATA(cmsg),
            fd_bytes,
        );
    }

    loop {
        let rv = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if (rv as usize) != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short sendmsg for fd passing",
            ));
        }
        return Ok(());
    }
}

/// Receive exactly `expected_fds` fds and `payload_len` payload bytes.
pub fn recv_fds(
    sock: &UnixStream,
    expected_fds: usize,
    payload_len: usize,
) -> io::Result<(Vec<OwnedFd>, Vec<u8>)> {
    assert!(expected_fds <= MAX_FDS);

    let mut payload = vec![0u8; payload_len];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut cmsg_buf = CmsgBuf { buf: [0u8; 128] };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    unsafe {
        msg.msg_control = cmsg_buf.buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE((expected_fds * mem::size_of::<RawFd>()) as u32) as _;
    }

    let received = loop {
        let rv = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break rv as usize;
    };
    if received == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed during fd handshake",
        ));
    }
    if received != payload_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "short payload in fd handshake",
        ));
    }

    let mut fds = Vec::with_capacity(expected_fds);
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    // Safety: the kernel installed these fds into our
                    // process as part of recvmsg; we take ownership.
                    fds.push(OwnedFd::from_raw_fd(*data.add(i)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if fds.len() != expected_fds {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {} fds, received {}", expected_fds, fds.len()),
        ));
    }
    Ok((fds, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn passes_an_eventfd() {
        let (a, b) = UnixStream::pair().unwrap();
        let db = crate::doorbell::Doorbell::new().unwrap();

        send_fds(&a, &[db.as_raw_fd()], &7u64.to_le_bytes()).unwrap();
        let (fds, payload) = recv_fds(&b, 1, 8).unwrap();
        assert_eq!(fds.len(), 1);
        assert_eq!(u64::from_le_bytes(payload.try_into().unwrap()), 7);

        // The received fd refers to the same eventfd object.
        let adopted = crate::doorbell::Doorbell::from_owned_fd(fds.into_iter().next().unwrap())
            .unwrap();
        db.ring().unwrap();
        assert_eq!(adopted.drain().unwrap(), 1);
    }

    #[test]
    fn passes_three_fds_at_once() {
        let (a, b) = UnixStream::pair().unwrap();
        let seg = crate::shm::Segment::create("ferry-test", 4096).unwrap();
        let d1 = crate::doorbell::Doorbell::new().unwrap();
        let d2 = crate::doorbell::Doorbell::new().unwrap();

        send_fds(
            &a,
            &[seg.as_raw_fd(), d1.as_raw_fd(), d2.as_raw_fd()],
            &4096u64.to_le_bytes(),
        )
        .unwrap();
        let (fds, payload) = recv_fds(&b, 3, 8).unwrap();
        assert_eq!(fds.len(), 3);
        assert_eq!(u64::from_le_bytes(payload.try_into().unwrap()), 4096);
    }

    #[test]
    fn eof_is_reported() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let err = recv_fds(&b, 1, 8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn stray_bytes_without_fds_are_rejected() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(&[0u8; 8]).unwrap();
        assert!(recv_fds(&b, 1, 8).is_err());
    }
}
