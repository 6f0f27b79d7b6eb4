//! Packet-level plumbing: the nonblocking UDP socket, in-process loopback
//! pipes, and per-peer sequence/ack tracking.
//!
//! Everything here is caller-driven; sockets are polled from `tick` and
//! nothing blocks or spawns.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::channel::{RTO_MAX_SECS, RTO_MIN_SECS};
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader, sequence_greater_than};

const RECV_BUFFER_SIZE: usize = 65536;

pub(crate) fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    hasher.finish()
}

fn rand_percent() -> f32 {
    (rand_u64() % 10000) as f32 / 10000.0
}

/// Outgoing packet drop simulation, for tests and soak runs.
#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() < self.loss_percent / 100.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

#[derive(Debug, Clone)]
struct PendingPacket {
    sequence: u32,
    send_time: Instant,
    acked: bool,
}

/// Tracks sent packets against incoming ack windows and keeps an RFC 6298
/// smoothed RTT.
#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<PendingPacket>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track_packet(&mut self, sequence: u32) {
        while self.pending.len() >= self.max_pending {
            self.pending.pop_front();
        }
        self.pending.push_back(PendingPacket {
            sequence,
            send_time: Instant::now(),
            acked: false,
        });
    }

    /// Applies an ack + 32-bit history bitfield, returning newly acked
    /// packet sequences.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32) -> Vec<u32> {
        let mut acked_sequences = Vec::new();
        let mut rtt_samples = Vec::new();
        let now = Instant::now();

        for pending in &mut self.pending {
            if pending.acked {
                continue;
            }
            let is_acked = if pending.sequence == ack {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                diff <= 32 && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };
            if is_acked {
                pending.acked = true;
                acked_sequences.push(pending.sequence);
                rtt_samples.push(now.duration_since(pending.send_time).as_secs_f32() * 1000.0);
            }
        }

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }
        while self.pending.front().is_some_and(|p| p.acked) {
            self.pending.pop_front();
        }
        acked_sequences
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }
}

/// Remembers what arrived so outgoing headers can carry the ack window, and
/// filters duplicate packets.
#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bitfield: u32,
    recent_sequences: VecDeque<u32>,
    max_recent: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: 0,
            received_bitfield: 0,
            recent_sequences: VecDeque::with_capacity(128),
            max_recent: 128,
        }
    }

    pub fn record_received(&mut self, sequence: u32) -> bool {
        if self.recent_sequences.contains(&sequence) {
            return false;
        }
        if self.recent_sequences.len() >= self.max_recent {
            self.recent_sequences.pop_front();
        }
        self.recent_sequences.push_back(sequence);

        if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            if diff <= 32 {
                self.received_bitfield = (self.received_bitfield << diff) | 1;
            } else {
                self.received_bitfield = 0;
            }
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }
        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }
}

/// Per-peer packet state: outgoing sequence, both trackers, and liveness.
#[derive(Debug)]
pub struct PacketTracking {
    send_sequence: u32,
    ack_tracker: AckTracker,
    receive_tracker: ReceiveTracker,
    last_receive_time: Instant,
    pub stats: NetworkStats,
}

impl Default for PacketTracking {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketTracking {
    pub fn new() -> Self {
        Self {
            send_sequence: 0,
            ack_tracker: AckTracker::new(256),
            receive_tracker: ReceiveTracker::new(),
            last_receive_time: Instant::now(),
            stats: NetworkStats::default(),
        }
    }

    /// Stamps the next outgoing header and tracks it for acking.
    pub fn next_header(&mut self) -> PacketHeader {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        let (ack, ack_bitfield) = self.receive_tracker.ack_data();
        self.ack_tracker.track_packet(sequence);
        self.stats.packets_sent += 1;
        PacketHeader::new(sequence, ack, ack_bitfield)
    }

    /// Accepts an incoming header. Returns `None` for duplicates, otherwise
    /// the packet sequences its ack window settled.
    pub fn accept(&mut self, header: &PacketHeader) -> Option<Vec<u32>> {
        if !self.receive_tracker.record_received(header.sequence) {
            return None;
        }
        let acked = self.ack_tracker.process_ack(header.ack, header.ack_bitfield);
        self.last_receive_time = Instant::now();
        self.stats.packets_received += 1;
        self.stats.rtt_ms = self.ack_tracker.srtt();
        self.stats.rtt_variance = self.ack_tracker.rtt_var();
        Some(acked)
    }

    /// Retransmission timeout derived from the smoothed RTT.
    pub fn rto_secs(&self) -> f64 {
        let rto = (self.ack_tracker.srtt() + 4.0 * self.ack_tracker.rtt_var()) as f64 / 1000.0;
        rto.clamp(RTO_MIN_SECS, RTO_MAX_SECS)
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }
}

/// Nonblocking UDP socket with a reusable receive buffer.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: Vec<u8>,
}

impl UdpEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_PACKET_SIZE {
            log::debug!("sending oversized packet of {} bytes", data.len());
        }
        self.socket.send_to(data, addr)
    }

    /// Drains every datagram currently queued on the socket.
    pub fn receive(&mut self) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
        let mut out = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => out.push((self.recv_buffer[..size].to_vec(), addr)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// One direction-pair of in-process byte queues. Loopback clients exchange
/// the same serialized packets a socket would carry, so the whole framing
/// and channel path stays identical.
#[derive(Clone)]
pub struct LoopbackPipe {
    tx: Rc<RefCell<VecDeque<Vec<u8>>>>,
    rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl LoopbackPipe {
    pub fn pair() -> (LoopbackPipe, LoopbackPipe) {
        let a = Rc::new(RefCell::new(VecDeque::new()));
        let b = Rc::new(RefCell::new(VecDeque::new()));
        (
            LoopbackPipe {
                tx: a.clone(),
                rx: b.clone(),
            },
            LoopbackPipe { tx: b, rx: a },
        )
    }

    pub fn send(&self, data: Vec<u8>) {
        self.tx.borrow_mut().push_back(data);
    }

    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.borrow_mut().pop_front()
    }
}
