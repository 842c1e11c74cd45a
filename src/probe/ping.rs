//! Ping probe implementation with native ICMP and command fallback.
//!
//! A probe sends [`PING_COUNT`] echo requests one second apart and is healthy
//! only if every one of them is answered within [`PING_TIMEOUT`]. Native
//! sockets run in spawn_blocking.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, ProbeResult};

/// Echo requests sent per probe.
pub const PING_COUNT: u32 = 3;

/// Time budget for the whole echo sequence.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Gap between echo requests; sends do not wait for replies.
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest read timeout handed to the socket.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter shared by all probes in the process.
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn next_sequence() -> u16 {
    PING_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Packets sent and answered during one probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingStats {
    pub sent: u32,
    pub received: u32,
}

impl PingStats {
    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 100.0;
        }
        100.0 * f64::from(self.sent - self.received.min(self.sent)) / f64::from(self.sent)
    }

    /// Any missing reply fails the probe, even if some packets made it.
    pub fn into_result(self) -> ProbeResult {
        if self.received < PING_COUNT {
            return Err(ProbeError::PacketLoss {
                sent: self.sent,
                received: self.received,
            });
        }
        Ok(())
    }
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Run a ping probe against the given host.
pub async fn run_ping_probe(host: &str) -> ProbeResult {
    let stats = ping(host).await?;
    tracing::debug!(
        "--- {} ping statistics --- {} packets transmitted, {} packets received, {:.1}% packet loss",
        host,
        stats.sent,
        stats.received,
        stats.loss_percent()
    );
    stats.into_result()
}

async fn ping(host: &str) -> Result<PingStats, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        // Resolve address before spawn_blocking (DNS is async)
        let ip = resolve_address(host).await?;

        let result = tokio::task::spawn_blocking(move || {
            run_blocking_ping(ip, PING_COUNT, PING_TIMEOUT)
        })
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        return match result {
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    host,
                    msg
                );
                run_ping_command(host).await
            }
            other => other,
        };
    }

    run_ping_command(host).await
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// How long the next recv may block: until the next send is due or the
/// deadline, whichever comes first. `None` once the deadline is too close
/// to wait at all.
fn recv_timeout(now: Instant, deadline: Instant, next_send: Option<Instant>) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(now);
    // Sub-microsecond timeouts round to a zero timeval, which never expires
    if remaining < MIN_READ_TIMEOUT {
        return None;
    }
    let wait = match next_send {
        Some(at) => at.saturating_duration_since(now).min(remaining),
        None => remaining,
    };
    Some(wait.max(MIN_READ_TIMEOUT))
}

/// Send `count` echo requests one [`PING_INTERVAL`] apart and collect
/// replies until all are in or `timeout` runs out.
/// Runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, count: u32, timeout: Duration) -> Result<PingStats, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(s) => (s, true),
        Err(_) => Socket::new(domain, Type::DGRAM, Some(protocol))
            .map(|s| (s, false))
            .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?,
    };

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let start = Instant::now();
    let deadline = start + timeout;
    let identifier: u16 = rand::random();
    // DGRAM sockets get their identifier rewritten by the kernel
    let expected_id = raw.then_some(identifier);

    let mut stats = PingStats::default();
    let mut pending: Vec<(u16, Instant)> = Vec::with_capacity(count as usize);
    let mut next_send = (count > 0).then_some(start);
    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];

    while stats.received < count {
        let now = Instant::now();
        if let Some(due) = next_send.filter(|due| *due <= now) {
            let sequence = next_sequence();
            let packet = match ip {
                IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
                IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
            };
            socket.send(&packet).map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    ProbeError::Network(format!("Permission denied: {}", e))
                } else {
                    ProbeError::Network(format!("Failed to send: {}", e))
                }
            })?;
            pending.push((sequence, now));
            stats.sent += 1;
            next_send = (stats.sent < count).then(|| due + PING_INTERVAL);
        }

        let Some(wait) = recv_timeout(Instant::now(), deadline, next_send) else {
            // Out of time; unanswered packets count as lost
            break;
        };
        let Some(len) = recv_within(&socket, &mut buf, wait)? else {
            continue;
        };
        // SAFETY: recv initialized `len` bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let Some((reply_id, reply_seq)) = parse_echo_reply(data, ip.is_ipv4()) else {
            continue;
        };
        if expected_id.is_some_and(|id| id != reply_id) {
            // Someone else's packet
            continue;
        }
        if let Some(pos) = pending.iter().position(|(seq, _)| *seq == reply_seq) {
            let (sequence, sent_at) = pending.swap_remove(pos);
            stats.received += 1;
            tracing::debug!(
                "{} bytes from {}: icmp_seq={} time={:?}",
                len,
                ip,
                sequence,
                sent_at.elapsed()
            );
        }
    }

    Ok(stats)
}

/// Receive one packet, blocking at most `wait`. `None` if nothing arrived.
fn recv_within(
    socket: &Socket,
    buf: &mut [MaybeUninit<u8>],
    wait: Duration,
) -> Result<Option<usize>, ProbeError> {
    socket
        .set_read_timeout(Some(wait))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    match socket.recv(buf) {
        Ok(len) => Ok(Some(len)),
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Ok(None)
        }
        Err(e) => Err(ProbeError::Network(format!("Failed to receive: {}", e))),
    }
}

/// Extract (identifier, sequence) from an echo reply, skipping the IPv4
/// header when the socket delivers one.
fn parse_echo_reply(buf: &[u8], ipv4: bool) -> Option<(u16, u16)> {
    let (offset, reply_type) = if ipv4 {
        let offset = if buf.first()? >> 4 == 4 {
            usize::from(buf[0] & 0x0F) * 4
        } else {
            0
        };
        (offset, 0u8)
    } else {
        (0, 129u8)
    };

    let icmp = buf.get(offset..offset + 8)?;
    if icmp[0] != reply_type {
        return None;
    }
    Some((
        u16::from_be_bytes([icmp[4], icmp[5]]),
        u16::from_be_bytes([icmp[6], icmp[7]]),
    ))
}

fn timestamp_payload() -> [u8; 8] {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos.to_be_bytes()
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&timestamp_payload());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128; // Type: Echo Request
    packet[1] = 0; // Code: 0
    // Checksum at [2..4] is filled in by the kernel
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&timestamp_payload());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(host: &str) -> Result<PingStats, ProbeError> {
    let count = PING_COUNT.to_string();
    let deadline = PING_TIMEOUT.as_secs().max(1).to_string();

    // -w is the overall deadline on Linux, -t on the BSDs
    let deadline_flag = if cfg!(any(target_os = "macos", target_os = "freebsd")) {
        "-t"
    } else {
        "-w"
    };

    let output = Command::new("ping")
        .args(["-c", count.as_str(), deadline_flag, deadline.as_str(), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines().filter(|l| l.contains("time=")) {
        tracing::debug!("{}", line);
    }

    // Packet loss makes ping exit non-zero, so parse before looking at status
    if let Some(stats) = parse_ping_summary(&stdout) {
        return Ok(stats);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ProbeError::Command(format!(
        "ping exited with {}: {}",
        output.status,
        stderr.trim()
    )))
}

/// Parse the transmitted/received counts from ping's summary line.
fn parse_ping_summary(output: &str) -> Option<PingStats> {
    // Linux: "3 packets transmitted, 2 received"
    // macOS: "3 packets transmitted, 2 packets received"
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?P<sent>\d+) packets transmitted, (?P<recv>\d+) (?:packets )?received")
            .expect("valid regex")
    });

    let caps = re.captures(output)?;
    Some(PingStats {
        sent: caps.name("sent")?.as_str().parse().ok()?,
        received: caps.name("recv")?.as_str().parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum() {
        let mut packet = vec![0u8; 8];
        packet[0] = 8; // Echo request
        packet[4] = 0x12; // ID high
        packet[5] = 0x34; // ID low
        packet[7] = 0x01; // Seq low

        let checksum = icmp_checksum(&packet);
        assert_eq!(checksum, !(0x0800u16 + 0x1234 + 0x0001));
    }

    #[test]
    fn test_checksum_verifies() {
        // A packet with its checksum filled in sums to zero
        let packet = build_icmp_echo_request(0xBEEF, 7);
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence
    }

    #[test]
    fn test_build_icmpv6_packet() {
        let packet = build_icmpv6_echo_request(0x1234, 0x0002);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
        assert_eq!(packet[6..8], [0x00, 0x02]);
    }

    #[test]
    fn test_parse_echo_reply_raw_v4() {
        // 20 byte IP header followed by an echo reply
        let mut buf = vec![0u8; 28];
        buf[0] = 0x45;
        buf[20] = 0; // Echo Reply
        buf[24..26].copy_from_slice(&0xABCDu16.to_be_bytes());
        buf[26..28].copy_from_slice(&9u16.to_be_bytes());
        assert_eq!(parse_echo_reply(&buf, true), Some((0xABCD, 9)));
    }

    #[test]
    fn test_parse_echo_reply_dgram_v4() {
        let mut buf = vec![0u8; 8];
        buf[4..6].copy_from_slice(&1u16.to_be_bytes());
        buf[6..8].copy_from_slice(&2u16.to_be_bytes());
        assert_eq!(parse_echo_reply(&buf, true), Some((1, 2)));
    }

    #[test]
    fn test_parse_echo_reply_rejects_requests_and_short() {
        // Our own echo request looped back
        let request = build_icmp_echo_request(1, 1);
        assert_eq!(parse_echo_reply(&request, true), None);
        assert_eq!(parse_echo_reply(&[0u8; 4], true), None);

        let mut v6 = vec![0u8; 8];
        v6[0] = 129;
        assert_eq!(parse_echo_reply(&v6, false), Some((0, 0)));
        v6[0] = 128;
        assert_eq!(parse_echo_reply(&v6, false), None);
    }

    #[test]
    fn test_recv_timeout_near_deadline_expires() {
        let now = Instant::now();
        assert_eq!(recv_timeout(now, now, None), None);
        assert_eq!(recv_timeout(now, now + Duration::from_nanos(500), None), None);
        assert_eq!(recv_timeout(now, now + Duration::from_micros(999), None), None);
        assert_eq!(recv_timeout(now + Duration::from_secs(1), now, None), None);
    }

    #[test]
    fn test_recv_timeout_bounds() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(5);

        assert_eq!(recv_timeout(now, deadline, None), Some(Duration::from_secs(5)));
        assert_eq!(
            recv_timeout(now, deadline, Some(now + PING_INTERVAL)),
            Some(PING_INTERVAL)
        );
        // A send scheduled past the deadline does not extend the wait
        assert_eq!(
            recv_timeout(now, deadline, Some(now + Duration::from_secs(9))),
            Some(Duration::from_secs(5))
        );
        // A send that is already due still gets a non-zero timeout
        assert_eq!(recv_timeout(now, deadline, Some(now)), Some(MIN_READ_TIMEOUT));
    }

    #[test]
    fn test_recv_within_honours_short_wait() {
        // Connected to a port nobody answers on; recv has to time out
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        socket.bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into()).unwrap();
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.connect(&peer.local_addr().unwrap().into()).unwrap();

        let mut buf = [MaybeUninit::<u8>::uninit(); 64];
        let started = Instant::now();
        let wait = recv_timeout(started, started + Duration::from_millis(50), None).unwrap();
        assert_eq!(recv_within(&socket, &mut buf, wait).unwrap(), None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_all_replies_required() {
        let full = PingStats { sent: 3, received: 3 };
        assert!(full.into_result().is_ok());

        let partial = PingStats { sent: 3, received: 2 };
        assert!(matches!(
            partial.into_result(),
            Err(ProbeError::PacketLoss { sent: 3, received: 2 })
        ));

        let none = PingStats { sent: 1, received: 0 };
        assert!(matches!(
            none.into_result(),
            Err(ProbeError::PacketLoss { received: 0, .. })
        ));
    }

    #[test]
    fn test_packet_loss_message() {
        let err = PingStats { sent: 3, received: 2 }.into_result().unwrap_err();
        assert!(err.to_string().starts_with("ping probe unfinished"));
    }

    #[test]
    fn test_loss_percent() {
        assert_eq!(PingStats { sent: 3, received: 3 }.loss_percent(), 0.0);
        assert_eq!(PingStats { sent: 0, received: 0 }.loss_percent(), 100.0);
        assert!((PingStats { sent: 3, received: 2 }.loss_percent() - 33.33).abs() < 0.01);
    }

    #[test]
    fn test_parse_ping_summary_linux() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms
64 bytes from 8.8.8.8: icmp_seq=2 ttl=117 time=12.1 ms

--- 8.8.8.8 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms
rtt min/avg/max/mdev = 12.100/12.200/12.300/0.100 ms"#;
        assert_eq!(
            parse_ping_summary(output),
            Some(PingStats { sent: 3, received: 2 })
        );
    }

    #[test]
    fn test_parse_ping_summary_macos() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
3 packets transmitted, 3 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        assert_eq!(
            parse_ping_summary(output),
            Some(PingStats { sent: 3, received: 3 })
        );
    }

    #[test]
    fn test_parse_ping_summary_garbage() {
        assert_eq!(parse_ping_summary("ping: unknown host nowhere"), None);
    }
}
