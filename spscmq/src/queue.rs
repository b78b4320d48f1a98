//! The ring endpoint.
//!
//! A [`MessageQueue`] binds to a [`Descriptor`], maps the two position
//! counters and the data ring it names, and then moves fixed-width records
//! through the ring without entering the kernel: the fast path is a bounded
//! sequence of atomic loads, arithmetic, byte copies, and one atomic store.
//!
//! The counters live in shared memory and follow a strict single-writer
//! discipline: only the writing endpoint advances the write position, only
//! the reading endpoint advances the read position, and each side observes
//! the other's counter with an acquire load that pairs with the release
//! store ending the peer's previous operation. That pairing is the only
//! synchronisation in the queue; there are no locks and no blocking.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::descriptor::Descriptor;
use crate::mapping::MappedRegion;
use crate::record::Record;

/// One contiguous byte run of a (possibly wrapping) ring operation.
#[derive(Clone, Copy)]
struct Run {
    ptr: *mut u8,
    len: usize,
}

/// The at-most-two contiguous runs a request resolves to. The second run is
/// empty unless the request crosses the ring boundary.
struct Transaction {
    first: Run,
    second: Run,
}

/// The three shared regions of a bound endpoint.
struct Mappings {
    read_ptr: MappedRegion,
    write_ptr: MappedRegion,
    ring: MappedRegion,
}

impl Mappings {
    #[inline(always)]
    fn read_counter(&self) -> &AtomicU64 {
        // Extent and 8-byte alignment were checked against the grantor
        // before mapping.
        unsafe { &*self.read_ptr.as_ptr().cast::<AtomicU64>() }
    }

    #[inline(always)]
    fn write_counter(&self) -> &AtomicU64 {
        unsafe { &*self.write_ptr.as_ptr().cast::<AtomicU64>() }
    }

    #[inline(always)]
    fn ring(&self) -> *mut u8 {
        self.ring.as_ptr()
    }

    fn split(&self, position: u64, capacity: usize, wanted: usize) -> Transaction {
        let offset = (position % capacity as u64) as usize;
        let contiguous = capacity - offset;
        let ring = self.ring();
        if contiguous < wanted {
            Transaction {
                first: Run {
                    ptr: unsafe { ring.add(offset) },
                    len: contiguous,
                },
                second: Run {
                    ptr: ring,
                    len: wanted - contiguous,
                },
            }
        } else {
            Transaction {
                first: Run {
                    ptr: unsafe { ring.add(offset) },
                    len: wanted,
                },
                second: Run { ptr: ring, len: 0 },
            }
        }
    }

    /// Space accounting already happened in the caller. The acquire load of
    /// the read counter pairs with the reader's release in `commit_read`,
    /// so bytes the reader freed are safe to overwrite from here on.
    #[inline(always)]
    fn begin_write(&self, capacity: usize, wanted: usize) -> Transaction {
        let _ = self.read_counter().load(Ordering::Acquire);
        let write = self.write_counter().load(Ordering::Relaxed);
        self.split(write, capacity, wanted)
    }

    /// Sole writer of the write counter, so the relaxed load cannot race.
    #[inline(always)]
    fn commit_write(&self, written: usize) {
        let write = self.write_counter().load(Ordering::Relaxed);
        self.write_counter()
            .store(write.wrapping_add(written as u64), Ordering::Release);
    }

    /// The acquire load of the write counter pairs with the writer's release
    /// in `commit_write`, making the produced ring bytes visible.
    #[inline(always)]
    fn begin_read(&self, capacity: usize, wanted: usize) -> Transaction {
        let _ = self.write_counter().load(Ordering::Acquire);
        let read = self.read_counter().load(Ordering::Relaxed);
        self.split(read, capacity, wanted)
    }

    #[inline(always)]
    fn commit_read(&self, consumed: usize) {
        let read = self.read_counter().load(Ordering::Relaxed);
        self.read_counter()
            .store(read.wrapping_add(consumed as u64), Ordering::Release);
    }

    fn write_bytes(&self, capacity: usize, data: *const u8, len: usize) -> usize {
        let tx = self.begin_write(capacity, len);
        unsafe {
            ptr::copy_nonoverlapping(data, tx.first.ptr, tx.first.len);
            ptr::copy_nonoverlapping(data.add(tx.first.len), tx.second.ptr, tx.second.len);
        }
        let written = tx.first.len + tx.second.len;
        self.commit_write(written);
        written
    }

    fn read_bytes(&self, capacity: usize, data: *mut u8, len: usize) -> usize {
        let tx = self.begin_read(capacity, len);
        unsafe {
            ptr::copy_nonoverlapping(tx.first.ptr, data, tx.first.len);
            ptr::copy_nonoverlapping(tx.second.ptr, data.add(tx.first.len), tx.second.len);
        }
        let consumed = tx.first.len + tx.second.len;
        self.commit_read(consumed);
        consumed
    }
}

/// One process's handle to a shared-memory message queue.
///
/// Exactly one endpoint of a pair may write and exactly one may read; the
/// roles are a convention between the two processes, not something the
/// queue can enforce across the boundary. Within a process, `write`/`read`
/// taking `&mut self` keeps a single endpoint off two threads at once.
pub struct MessageQueue<T: Record> {
    desc: Descriptor,
    maps: Option<Mappings>,
    _record: PhantomData<T>,
}

// The Record contract excludes pointers and heap handles, so an endpoint
// can change threads regardless of what the marker type would auto-derive.
unsafe impl<T: Record> Send for MessageQueue<T> {}

impl<T: Record> MessageQueue<T> {
    /// Bind to a descriptor.
    ///
    /// A descriptor that fails the precondition set (no usable handle, fewer
    /// than [`Descriptor::MIN_GRANTOR_COUNT`] grantors, a quantum different
    /// from `size_of::<T>()`, or counter/ring grantors that cannot back the
    /// queue) yields a permanently invalid endpoint: nothing is mapped,
    /// [`is_valid`](Self::is_valid) returns `false`, and every operation
    /// refuses.
    ///
    /// Both position counters are zeroed during binding, so binding an
    /// endpoint to an already-active queue resets the stream. A pair of
    /// endpoints must both bind while the queue is quiescent.
    ///
    /// # Panics
    ///
    /// Panics if mapping any of the three regions fails. A well-formed
    /// descriptor asserts its regions are mappable, so a mapping failure is
    /// an environment or programming error, not a runtime condition.
    pub fn new(desc: Descriptor) -> Self {
        if !Self::binds(&desc) {
            #[cfg(feature = "trace")]
            tracing::trace!(
                handle_valid = desc.is_handle_valid(),
                grantors = desc.grantor_count(),
                quantum = desc.quantum(),
                record_width = mem::size_of::<T>(),
                "descriptor failed the bind preconditions"
            );
            return MessageQueue {
                desc,
                maps: None,
                _record: PhantomData,
            };
        }

        let maps = Mappings {
            read_ptr: Self::map_region(&desc, Descriptor::READ_POINTER, "read pointer"),
            write_ptr: Self::map_region(&desc, Descriptor::WRITE_POINTER, "write pointer"),
            ring: Self::map_region(&desc, Descriptor::DATA_RING, "data ring"),
        };

        maps.read_counter().store(0, Ordering::Release);
        maps.write_counter().store(0, Ordering::Release);

        #[cfg(feature = "trace")]
        tracing::trace!(
            capacity = desc.size(),
            quantum = desc.quantum(),
            "endpoint bound"
        );

        MessageQueue {
            desc,
            maps: Some(maps),
            _record: PhantomData,
        }
    }

    /// The precondition set a descriptor must pass before anything is
    /// mapped. Failures land in the invalid state rather than escalating,
    /// so a malformed descriptor received from a peer cannot panic us.
    fn binds(desc: &Descriptor) -> bool {
        if !desc.is_handle_valid()
            || desc.grantor_count() < Descriptor::MIN_GRANTOR_COUNT
            || desc.quantum() != mem::size_of::<T>()
            || desc.quantum() == 0
        {
            return false;
        }
        if desc.size() == 0 || desc.size() % desc.quantum() != 0 {
            return false;
        }

        let grantors = desc.grantors();
        for position in [Descriptor::READ_POINTER, Descriptor::WRITE_POINTER] {
            let grantor = &grantors[position];
            if grantor.extent < mem::size_of::<u64>()
                || grantor.offset % mem::align_of::<AtomicU64>() != 0
            {
                return false;
            }
        }
        if grantors[Descriptor::DATA_RING].extent < desc.size() {
            return false;
        }

        grantors[..Descriptor::MIN_GRANTOR_COUNT]
            .iter()
            .all(|grantor| desc.handle().fd(grantor.fd_index).is_some())
    }

    fn map_region(desc: &Descriptor, position: usize, name: &str) -> MappedRegion {
        match MappedRegion::map(desc.handle(), &desc.grantors()[position]) {
            Ok(region) => region,
            Err(err) => panic!("failed to map required {name} region: {err:#}"),
        }
    }

    /// Whether all three regions are mapped.
    pub fn is_valid(&self) -> bool {
        self.maps.is_some()
    }

    /// Bytes per record.
    pub fn quantum_size(&self) -> usize {
        self.desc.quantum()
    }

    /// Records the ring can hold.
    pub fn quantum_count(&self) -> usize {
        match self.desc.quantum() {
            0 => 0,
            quantum => self.desc.size() / quantum,
        }
    }

    /// Bytes available to read.
    ///
    /// Relaxed loads are enough here: the result is a hint, and any
    /// dependent access performs its own acquire load in `begin_read` /
    /// `begin_write`.
    pub fn available_to_read(&self) -> usize {
        let Some(maps) = &self.maps else { return 0 };
        let write = maps.write_counter().load(Ordering::Relaxed);
        let read = maps.read_counter().load(Ordering::Relaxed);
        write.wrapping_sub(read) as usize
    }

    /// Bytes available to write.
    pub fn available_to_write(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        self.desc.size().saturating_sub(self.available_to_read())
    }

    /// Append one record. Returns `false` without side effect when the
    /// queue is full or the endpoint is invalid.
    pub fn write(&mut self, record: &T) -> bool {
        self.write_many(slice::from_ref(record))
    }

    /// Append `records.len()` records as one FIFO unit.
    ///
    /// Either the whole slice is copied in and the write position advanced,
    /// or nothing happens and `false` is returned. A wrapping write crosses
    /// the ring boundary at most once. An empty slice succeeds without
    /// moving the stream.
    pub fn write_many(&mut self, records: &[T]) -> bool {
        let Some(maps) = &self.maps else { return false };
        let wanted = mem::size_of_val(records);
        if self.available_to_write() < wanted {
            #[cfg(feature = "trace")]
            tracing::trace!(wanted, free = self.available_to_write(), "write refused");
            return false;
        }
        maps.write_bytes(self.desc.size(), records.as_ptr().cast(), wanted) == wanted
    }

    /// Consume one record. Returns `false` without side effect when the
    /// queue is empty or the endpoint is invalid.
    pub fn read(&mut self, record: &mut T) -> bool {
        self.read_many(slice::from_mut(record))
    }

    /// Consume `records.len()` records as one FIFO unit.
    ///
    /// Either the whole slice is filled and the read position advanced, or
    /// nothing happens and `false` is returned.
    pub fn read_many(&mut self, records: &mut [T]) -> bool {
        let Some(maps) = &self.maps else { return false };
        let wanted = mem::size_of_val(records);
        if self.available_to_read() < wanted {
            #[cfg(feature = "trace")]
            tracing::trace!(wanted, pending = self.available_to_read(), "read refused");
            return false;
        }
        maps.read_bytes(self.desc.size(), records.as_mut_ptr().cast(), wanted) == wanted
    }

    /// Read-only view of the bound descriptor, e.g. for rebroadcast to the
    /// peer during a handshake.
    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Grantor, NativeHandle};
    use rstest::*;

    fn queue<T: Record>(records: usize) -> MessageQueue<T> {
        let desc = Descriptor::create(records, mem::size_of::<T>()).unwrap();
        MessageQueue::new(desc)
    }

    #[test]
    fn write_then_read_preserves_order() {
        let mut q = queue::<u8>(16);

        assert!(q.write_many(&[1, 2, 3, 4, 5]));
        assert_eq!(q.available_to_read(), 5);
        assert_eq!(q.available_to_write(), 11);

        let mut out = [0u8; 5];
        assert!(q.read_many(&mut out));
        assert_eq!(out, [1, 2, 3, 4, 5]);
        assert_eq!(q.available_to_read(), 0);
        assert_eq!(q.available_to_write(), 16);
    }

    #[test]
    fn write_beyond_free_space_is_refused() {
        let mut q = queue::<u8>(16);

        assert!(q.write_many(&[0x55; 5]));
        assert!(!q.write_many(&[0xA; 14]));
        assert_eq!(q.available_to_write(), 11);

        assert!(q.write_many(&[0xA; 11]));
        assert_eq!(q.available_to_write(), 0);
        assert!(!q.write(&0xF));

        let mut out = [0u8; 16];
        assert!(q.read_many(&mut out));
        assert_eq!(&out[..5], &[0x55; 5]);
        assert_eq!(&out[5..], &[0xA; 11]);
    }

    #[test]
    fn wraps_across_the_ring_boundary() {
        let mut q = queue::<u8>(8);

        assert!(q.write_many(&[1, 2, 3, 4, 5, 6]));
        let mut head = [0u8; 4];
        assert!(q.read_many(&mut head));
        assert_eq!(head, [1, 2, 3, 4]);

        // Crosses byte 8 back to byte 0.
        assert!(q.write_many(&[7, 8, 9, 10]));
        let mut tail = [0u8; 6];
        assert!(q.read_many(&mut tail));
        assert_eq!(tail, [5, 6, 7, 8, 9, 10]);
        assert_eq!(q.available_to_read(), 0);
    }

    #[test]
    fn empty_queue_refuses_reads() {
        let mut q = queue::<u8>(8);
        let mut out = 0u8;
        assert!(!q.read(&mut out));
        assert_eq!(q.available_to_read(), 0);
    }

    #[test]
    fn zero_count_operations_succeed_without_movement() {
        let mut q = queue::<u8>(8);

        assert!(q.write_many(&[]));
        let mut none = [0u8; 0];
        assert!(q.read_many(&mut none));
        assert_eq!(q.available_to_read(), 0);
        assert_eq!(q.available_to_write(), 8);

        assert!(q.write(&9));
        assert!(q.write_many(&[]));
        assert_eq!(q.available_to_read(), 1);
    }

    #[rstest]
    #[case::whole_ring(16, true)]
    #[case::beyond_ring(17, false)]
    fn filling_the_whole_ring(#[case] count: usize, #[case] accepted: bool) {
        let mut q = queue::<u8>(16);
        let data = vec![7u8; count];
        assert_eq!(q.write_many(&data), accepted);
        assert_eq!(q.available_to_read(), if accepted { count } else { 0 });
    }

    #[test]
    fn unit_forms_forward_to_bulk() {
        let mut q = queue::<u32>(4);
        assert!(q.write(&0xDEAD_BEEF));
        let mut out = 0u32;
        assert!(q.read(&mut out));
        assert_eq!(out, 0xDEAD_BEEF);
    }

    #[test]
    fn accessors_report_geometry() {
        let q = queue::<u64>(32);
        assert!(q.is_valid());
        assert_eq!(q.quantum_size(), 8);
        assert_eq!(q.quantum_count(), 32);
        assert_eq!(q.available_to_write(), 256);
        assert_eq!(q.descriptor().size(), 256);
    }

    #[test]
    fn exact_fit_write_uses_a_single_run() {
        let q = queue::<u8>(16);
        let maps = q.maps.as_ref().unwrap();

        maps.commit_write(12);

        let tx = maps.begin_write(16, 4);
        assert_eq!(tx.first.len, 4);
        assert_eq!(tx.second.len, 0);
        assert_eq!(tx.first.ptr, unsafe { maps.ring().add(12) });

        let tx = maps.begin_write(16, 5);
        assert_eq!(tx.first.len, 4);
        assert_eq!(tx.second.len, 1);
        assert_eq!(tx.second.ptr, maps.ring());
    }

    #[test]
    fn full_capacity_write_when_empty_is_one_run() {
        let q = queue::<u8>(16);
        let maps = q.maps.as_ref().unwrap();

        let tx = maps.begin_write(16, 16);
        assert_eq!(tx.first.len, 16);
        assert_eq!(tx.second.len, 0);
        assert_eq!(tx.first.ptr, maps.ring());
    }

    #[test]
    fn fifo_survives_many_wraps() {
        let mut q = queue::<u32>(16);
        let mut next_in = 0u32;
        let mut next_out = 0u32;
        let mut buf = [0u32; 7];

        for round in 0..1000usize {
            for _ in 0..(round % 5) + 1 {
                if q.write(&next_in) {
                    next_in += 1;
                }
            }
            let drain = (round % 7).min(q.available_to_read() / q.quantum_size());
            if drain > 0 {
                assert!(q.read_many(&mut buf[..drain]));
                for &v in &buf[..drain] {
                    assert_eq!(v, next_out);
                    next_out += 1;
                }
            }
        }

        let mut v = 0u32;
        while q.read(&mut v) {
            assert_eq!(v, next_out);
            next_out += 1;
        }
        assert_eq!(next_in, next_out);
    }

    #[test]
    fn peer_endpoints_share_the_stream() {
        let (mut writer, mut reader) = crate::channel::<u32>(16).unwrap();

        assert!(writer.write(&42));
        assert_eq!(reader.available_to_read(), 4);
        let mut out = 0u32;
        assert!(reader.read(&mut out));
        assert_eq!(out, 42);
        assert_eq!(writer.available_to_write(), 64);
    }

    #[test]
    fn late_binding_resets_the_stream() {
        let desc = Descriptor::create(8, 1).unwrap();
        let peer = desc.try_clone().unwrap();

        let mut writer = MessageQueue::<u8>::new(desc);
        assert!(writer.write(&1));

        let reader = MessageQueue::<u8>::new(peer);
        assert_eq!(reader.available_to_read(), 0);
        assert_eq!(writer.available_to_read(), 0);
    }

    #[test]
    fn quantum_mismatch_invalidates_endpoint() {
        let desc = Descriptor::create(4, 8).unwrap();
        let mut q = MessageQueue::<u32>::new(desc);

        assert!(!q.is_valid());
        assert_eq!(q.available_to_read(), 0);
        assert_eq!(q.available_to_write(), 0);
        assert!(!q.write(&7));
        let mut out = 0u32;
        assert!(!q.read(&mut out));
    }

    #[test]
    fn invalid_handle_invalidates_endpoint() {
        let grantors = vec![
            Grantor {
                fd_index: 0,
                offset: 0,
                extent: 8,
            },
            Grantor {
                fd_index: 0,
                offset: 64,
                extent: 8,
            },
            Grantor {
                fd_index: 0,
                offset: 4096,
                extent: 16,
            },
        ];
        let desc = Descriptor::new(16, 1, grantors, NativeHandle::new(vec![]));
        let q = MessageQueue::<u8>::new(desc);
        assert!(!q.is_valid());
    }

    #[test]
    fn too_few_grantors_invalidate_endpoint() {
        let desc = Descriptor::create(16, 1).unwrap();
        let handle = desc.handle().try_clone().unwrap();
        let grantors = desc.grantors()[..2].to_vec();
        let bad = Descriptor::new(16, 1, grantors, handle);
        assert!(!MessageQueue::<u8>::new(bad).is_valid());
    }

    #[test]
    fn undersized_ring_grantor_invalidates_endpoint() {
        let desc = Descriptor::create(16, 1).unwrap();
        let handle = desc.handle().try_clone().unwrap();
        let mut grantors = desc.grantors().to_vec();
        grantors[Descriptor::DATA_RING].extent = 8;
        let bad = Descriptor::new(16, 1, grantors, handle);
        assert!(!MessageQueue::<u8>::new(bad).is_valid());
    }

    #[test]
    fn misaligned_counter_grantor_invalidates_endpoint() {
        let desc = Descriptor::create(16, 1).unwrap();
        let handle = desc.handle().try_clone().unwrap();
        let mut grantors = desc.grantors().to_vec();
        grantors[Descriptor::READ_POINTER].offset = 3;
        let bad = Descriptor::new(16, 1, grantors, handle);
        assert!(!MessageQueue::<u8>::new(bad).is_valid());
    }

    #[test]
    fn out_of_range_fd_index_invalidates_endpoint() {
        let desc = Descriptor::create(16, 1).unwrap();
        let handle = desc.handle().try_clone().unwrap();
        let mut grantors = desc.grantors().to_vec();
        grantors[Descriptor::WRITE_POINTER].fd_index = 9;
        let bad = Descriptor::new(16, 1, grantors, handle);
        assert!(!MessageQueue::<u8>::new(bad).is_valid());
    }

    #[test]
    fn extra_grantors_are_ignored() {
        let desc = Descriptor::create(8, 1).unwrap();
        let handle = desc.handle().try_clone().unwrap();
        let mut grantors = desc.grantors().to_vec();
        grantors.push(Grantor {
            fd_index: 0,
            offset: 0,
            extent: 8,
        });
        let mut q = MessageQueue::<u8>::new(Descriptor::new(8, 1, grantors, handle));
        assert!(q.is_valid());
        assert!(q.write(&5));
    }
}
