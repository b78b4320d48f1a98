use clap::Parser;
use hdrhistogram::Histogram;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use spscmq::{Descriptor, Grantor, MessageQueue, NativeHandle, Record};
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Fixed-width record carried by the demo queue.
#[derive(Clone, Copy)]
#[repr(C)]
struct Sample {
    sent_at_nanos: u64,
    sequence: u64,
}

unsafe impl Record for Sample {}

#[derive(Parser, Debug)]
#[clap(name = "receiver")]
#[clap(about = "Shared-memory queue receiver example", long_about = None)]
struct Args {
    #[clap(short, long, default_value = "/tmp/spscmq_demo.sock")]
    socket_path: String,

    #[clap(short, long, default_value_t = 5)]
    report_interval_secs: u64,
}

fn deserialize_descriptor(wire: &[u8], fds: Vec<OwnedFd>) -> Descriptor {
    let word = |i: usize| u64::from_le_bytes(wire[i * 8..i * 8 + 8].try_into().unwrap()) as usize;
    let size = word(0);
    let quantum = word(1);
    let grantors = (0..word(2))
        .map(|g| Grantor {
            fd_index: word(3 + g * 3) as u32,
            offset: word(4 + g * 3),
            extent: word(5 + g * 3),
        })
        .collect();
    Descriptor::new(size, quantum, grantors, NativeHandle::new(fds))
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

    let mut stream = UnixStream::connect(&args.socket_path)?;
    info!(socket_path = %args.socket_path, "connected to sender");

    let mut wire = [0u8; 1024];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 8]);
    let mut iov = [std::io::IoSliceMut::new(&mut wire)];
    let (received, fds) = {
        let msg = recvmsg::<()>(
            stream.as_fd().as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )?;

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                fds.extend(
                    raw.into_iter()
                        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                );
            }
        }
        (msg.bytes, fds)
    };

    let desc = deserialize_descriptor(&wire[..received], fds);
    let mut queue = MessageQueue::<Sample>::new(desc);
    assert!(queue.is_valid(), "sender supplied an unusable descriptor");
    info!(
        quantum = queue.quantum_size(),
        records = queue.quantum_count(),
        "queue bound"
    );

    // Bound; the sender may start writing.
    stream.write_all(&[1])?;

    let mut latency = Histogram::<u64>::new(3)?;
    let mut expected = 0u64;
    let mut last_report = Instant::now();
    let mut batch = [Sample {
        sent_at_nanos: 0,
        sequence: 0,
    }; 64];

    loop {
        let ready = (queue.available_to_read() / queue.quantum_size()).min(batch.len());
        if ready == 0 {
            std::thread::sleep(Duration::from_micros(50));
        } else if queue.read_many(&mut batch[..ready]) {
            let now = now_nanos();
            for sample in &batch[..ready] {
                if sample.sequence != expected {
                    warn!(got = sample.sequence, expected, "sequence mismatch");
                }
                expected = sample.sequence + 1;
                latency
                    .record(now.saturating_sub(sample.sent_at_nanos))
                    .ok();
            }
        }

        if last_report.elapsed().as_secs() >= args.report_interval_secs {
            info!(
                received = expected,
                p50_nanos = latency.value_at_quantile(0.50),
                p99_nanos = latency.value_at_quantile(0.99),
                "latency report"
            );
            last_report = Instant::now();
        }
    }
}
