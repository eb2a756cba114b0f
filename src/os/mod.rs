// OS abstraction layer for qpx
// (c) 2024 Ross Younger

#[cfg(unix)]
mod unix;

/// Kernel socket buffer controls.
///
/// Caution: On Linux, according to socket(7), the kernel doubles the buffer
/// size you set in setsockopt, and returns the doubled value in getsockopt!
pub trait SocketOptions {
    /// Wrapper for getsockopt `SO_SNDBUF`
    fn get_sendbuf(&self) -> anyhow::Result<usize>;
    /// Wrapper for setsockopt `SO_SNDBUF`
    fn set_sendbuf(&self, size: usize) -> anyhow::Result<()>;
    /// Wrapper for setsockopt `SO_SNDBUFFORCE` (privileged)
    fn force_sendbuf(&self, size: usize) -> anyhow::Result<()>;
    /// Wrapper for getsockopt `SO_RCVBUF`
    fn get_recvbuf(&self) -> anyhow::Result<usize>;
    /// Wrapper for setsockopt `SO_RCVBUF`
    fn set_recvbuf(&self, size: usize) -> anyhow::Result<()>;
    /// Wrapper for setsockopt `SO_RCVBUFFORCE` (privileged)
    fn force_recvbuf(&self, size: usize) -> anyhow::Result<()>;
}

static_assertions::assert_cfg!(unix, "This OS is not yet supported");
