//! Synchronous command channel to the simulation.
//!
//! The simulation exposes an RCON-style admin port: little-endian framed
//! packets `len | id | type | body \0 \0`, an auth handshake, then one
//! request/response per command.

use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Anything that can issue a text command and return the reply.
pub trait CommandChannel: Send + Sync {
    fn issue_command(&self, command: &str) -> Result<String>;
}

impl<F> CommandChannel for F
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    fn issue_command(&self, command: &str) -> Result<String> {
        self(command)
    }
}

/// Issue a harmless command a fixed number of times.
///
/// The first commands after connecting are sometimes dropped by the
/// simulation. Succeeds if any attempt succeeds.
pub fn warm_up(channel: &dyn CommandChannel, command: &str, attempts: u32) -> Result<()> {
    let mut last_err = None;
    let mut ok = 0u32;
    for attempt in 1..=attempts {
        match channel.issue_command(command) {
            Ok(reply) => {
                ok += 1;
                debug!(attempt, reply = %reply.trim(), "warmup command answered");
            }
            Err(e) => {
                warn!(attempt, error = %e, "warmup command failed");
                last_err = Some(e);
            }
        }
    }
    match (ok, last_err) {
        (0, Some(e)) => Err(e),
        _ => {
            info!(attempts, answered = ok, "command channel warmed up");
            Ok(())
        }
    }
}

// Packet types
const AUTH: i32 = 3;
const AUTH_RESPONSE: i32 = 2;
const EXEC_COMMAND: i32 = 2;
const RESPONSE_VALUE: i32 = 0;

/// Largest packet body accepted from the server.
const MAX_BODY: usize = 4 * 1024 * 1024;

#[derive(Debug)]
struct Packet {
    id: i32,
    kind: i32,
    body: String,
}

fn write_packet(stream: &mut impl Write, id: i32, kind: i32, body: &str) -> Result<()> {
    let len = (4 + 4 + body.len() + 2) as i32;
    let mut buf = Vec::with_capacity(4 + len as usize);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(body.as_bytes());
    buf.extend_from_slice(&[0, 0]);
    stream.write_all(&buf)?;
    stream.flush()?;
    Ok(())
}

fn read_packet(stream: &mut impl Read) -> Result<Packet> {
    let mut word = [0u8; 4];
    stream.read_exact(&mut word)?;
    let len = i32::from_le_bytes(word);
    if len < 10 || len as usize > MAX_BODY + 10 {
        return Err(SyncError::Command(format!("bad packet length {}", len)));
    }

    let mut rest = vec![0u8; len as usize];
    stream.read_exact(&mut rest)?;

    let id = i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
    let kind = i32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
    let body_bytes = &rest[8..rest.len() - 2];
    let body = String::from_utf8_lossy(body_bytes).into_owned();
    Ok(Packet { id, kind, body })
}

/// RCON client over TCP.
pub struct RconChannel {
    stream: Mutex<TcpStream>,
    next_id: AtomicI32,
}

impl RconChannel {
    /// Connect and authenticate.
    pub fn connect(addr: impl ToSocketAddrs, password: &str, timeout: Duration) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SyncError::Command("no address to connect to".into()))?;
        let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let auth_id = 1;
        write_packet(&mut stream, auth_id, AUTH, password)?;
        loop {
            let packet = read_packet(&mut stream)?;
            if packet.kind != AUTH_RESPONSE {
                // Some servers send an empty RESPONSE_VALUE first
                continue;
            }
            if packet.id == -1 {
                return Err(SyncError::Command("authentication rejected".into()));
            }
            break;
        }

        info!(%addr, "command channel connected");
        Ok(Self {
            stream: Mutex::new(stream),
            next_id: AtomicI32::new(auth_id + 1),
        })
    }
}

impl CommandChannel for RconChannel {
    fn issue_command(&self, command: &str) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stream = self.stream.lock();
        write_packet(&mut *stream, id, EXEC_COMMAND, command)?;

        // Skip stray replies to earlier, abandoned requests
        loop {
            let packet = read_packet(&mut *stream)?;
            if packet.id == id && packet.kind == RESPONSE_VALUE {
                debug!(id, command, "command answered");
                return Ok(packet.body);
            }
            debug!(expected = id, got = packet.id, "discarding unrelated reply");
        }
    }
}
