use clap::Parser;
use governor::{Quota, RateLimiter};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use spscmq::{Descriptor, MessageQueue, Record};
use std::io::Read;
use std::mem;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Fixed-width record carried by the demo queue.
#[derive(Clone, Copy)]
#[repr(C)]
struct Sample {
    sent_at_nanos: u64,
    sequence: u64,
}

unsafe impl Record for Sample {}

#[derive(Parser, Debug)]
#[clap(name = "sender")]
#[clap(about = "Shared-memory queue sender example", long_about = None)]
struct Args {
    #[clap(short, long, default_value = "/tmp/spscmq_demo.sock")]
    socket_path: String,

    #[clap(short, long, default_value_t = 100_000)]
    rate: u32,

    #[clap(short, long, default_value_t = 16384)]
    queue_records: usize,

    #[clap(short, long, default_value_t = 1_000_000)]
    print_interval: u64,
}

/// Geometry preamble sent next to the fds: capacity, quantum, grantor
/// count, then (fd_index, offset, extent) per grantor, all little-endian
/// u64. The fds themselves travel as `SCM_RIGHTS`.
fn serialize_descriptor(desc: &Descriptor) -> Vec<u8> {
    let grantors = desc.grantors();
    let mut wire = Vec::with_capacity((3 + grantors.len() * 3) * 8);
    wire.extend_from_slice(&(desc.size() as u64).to_le_bytes());
    wire.extend_from_slice(&(desc.quantum() as u64).to_le_bytes());
    wire.extend_from_slice(&(grantors.len() as u64).to_le_bytes());
    for grantor in grantors {
        wire.extend_from_slice(&(grantor.fd_index as u64).to_le_bytes());
        wire.extend_from_slice(&(grantor.offset as u64).to_le_bytes());
        wire.extend_from_slice(&(grantor.extent as u64).to_le_bytes());
    }
    wire
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos() as u64
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    debug!(?args, "sender configuration");

    let desc = Descriptor::create(args.queue_records, mem::size_of::<Sample>())?;
    let mut queue = MessageQueue::<Sample>::new(desc);
    assert!(queue.is_valid());

    let _ = std::fs::remove_file(&args.socket_path);
    let listener = UnixListener::bind(&args.socket_path)?;
    info!(socket_path = %args.socket_path, "sender listening");

    let (mut stream, _) = listener.accept()?;
    info!("receiver connected");

    let wire = serialize_descriptor(queue.descriptor());
    let fds: Vec<RawFd> = queue
        .descriptor()
        .handle()
        .fds()
        .iter()
        .map(|fd| fd.as_raw_fd())
        .collect();

    let iov = [std::io::IoSlice::new(&wire)];
    let cmsg = ControlMessage::ScmRights(&fds);
    sendmsg::<()>(
        stream.as_fd().as_raw_fd(),
        &iov,
        &[cmsg],
        MsgFlags::empty(),
        None,
    )?;

    // Binding zeroes the counters, so hold off until the peer has bound.
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack)?;
    info!("receiver bound, streaming");

    let limiter = RateLimiter::direct(Quota::per_second(
        NonZeroU32::new(args.rate).expect("rate must be nonzero"),
    ));

    let mut sequence = 0u64;
    loop {
        while limiter.check().is_err() {
            thread::sleep(Duration::from_micros(50));
        }

        let sample = Sample {
            sent_at_nanos: now_nanos(),
            sequence,
        };
        while !queue.write(&sample) {
            // Reader lagging; the queue never blocks, so pacing is on us.
            thread::sleep(Duration::from_micros(10));
        }
        sequence += 1;

        if sequence % args.print_interval == 0 {
            info!(
                sequence,
                available_to_write = queue.available_to_write(),
                "progress"
            );
        }
    }
}
