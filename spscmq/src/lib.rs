//! Single-producer single-reader message queue over descriptor-named
//! shared memory.
//!
//! Two cooperating processes pass fixed-width records through a byte ring
//! that lives in shared memory. A [`Descriptor`] — typically minted by one
//! side with [`Descriptor::create`] and handed to the peer over an IPC
//! handshake — names the regions: a 64-bit write position counter, a 64-bit
//! read position counter, and the data ring itself. Each process binds a
//! [`MessageQueue`] endpoint to its copy of the descriptor; from then on
//! the writer appends and the reader consumes, FIFO, without entering the
//! kernel.
//!
//! Operations never block and never partially succeed: a write that does
//! not fit, or a read of more than is pending, refuses and leaves the queue
//! untouched. Waiting for space or data is the caller's concern.
//!
//! ```rust
//! let (mut writer, mut reader) = spscmq::channel::<u32>(1024)?;
//!
//! assert!(writer.write_many(&[7, 8, 9]));
//! let mut out = [0u32; 3];
//! assert!(reader.read_many(&mut out));
//! assert_eq!(out, [7, 8, 9]);
//! # Ok::<(), eyre::Report>(())
//! ```

pub mod descriptor;
pub mod error;
pub mod mapping;
pub mod queue;
pub mod record;

pub use descriptor::{Descriptor, Grantor, NativeHandle};
pub use error::QueueError;
pub use queue::MessageQueue;
pub use record::Record;

// Re-export for convenience
pub use eyre::Result;

/// Create a queue sized for `record_count` records of `T` and bind a
/// writer/reader endpoint pair to it.
///
/// Both endpoints bind before either performs I/O, so the position counters
/// are quiescent when this returns. For cross-process use, mint a
/// [`Descriptor`] instead and send it to the peer during a handshake.
pub fn channel<T: Record>(
    record_count: usize,
) -> Result<(MessageQueue<T>, MessageQueue<T>)> {
    let desc = Descriptor::create(record_count, std::mem::size_of::<T>())?;
    let peer = desc.try_clone()?;
    Ok((MessageQueue::new(desc), MessageQueue::new(peer)))
}
