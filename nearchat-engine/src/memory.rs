//! In-memory transport backed by [`tokio::io::duplex`].
//!
//! Used by the test suites to pair two engines without touching the
//! network; production code uses [`crate::tcp`].

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use nearchat_core::transport::Connection;

/// Buffer capacity of each direction of the pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// One end of an in-memory duplex pipe.
pub struct MemoryConnection {
    stream: DuplexStream,
    peer: String,
}

/// Creates a connected pair of in-memory connections.
///
/// Bytes written to one end are readable from the other, in order, until
/// an end is dropped — after which the survivor sees `Ok(0)` on read,
/// just like a closed socket.
#[must_use]
pub fn memory_pair() -> (MemoryConnection, MemoryConnection) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    (
        MemoryConnection {
            stream: a,
            peer: "memory:b".into(),
        },
        MemoryConnection {
            stream: b,
            peer: "memory:a".into(),
        },
    )
}

impl Connection for MemoryConnection {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from in-memory connection")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to in-memory connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down in-memory connection")
        }
    }
}
