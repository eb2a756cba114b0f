// OS abstraction layer for qpx - Unix implementation
// (c) 2024 Ross Younger

use anyhow::Result;
use nix::sys::socket::{self, sockopt};
use std::net::UdpSocket;

use super::SocketOptions;

impl SocketOptions for UdpSocket {
    fn get_sendbuf(&self) -> Result<usize> {
        Ok(socket::getsockopt(self, sockopt::SndBuf)?)
    }

    fn set_sendbuf(&self, size: usize) -> Result<()> {
        socket::setsockopt(self, sockopt::SndBuf, &size)?;
        Ok(())
    }

    fn force_sendbuf(&self, size: usize) -> Result<()> {
        socket::setsockopt(self, sockopt::SndBufForce, &size)?;
        Ok(())
    }

    fn get_recvbuf(&self) -> Result<usize> {
        Ok(socket::getsockopt(self, sockopt::RcvBuf)?)
    }

    fn set_recvbuf(&self, size: usize) -> Result<()> {
        socket::setsockopt(self, sockopt::RcvBuf, &size)?;
        Ok(())
    }

    fn force_recvbuf(&self, size: usize) -> Result<()> {
        socket::setsockopt(self, sockopt::RcvBufForce, &size)?;
        Ok(())
    }
}
