//! In-process Modbus slave for integration tests
//!
//! Serves the same register tables over Modbus TCP (a loopback listener) or
//! RTU (any duplex byte stream). Behaviour switches let a test force an
//! exception, stay silent, or drop the connection on the next request.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use voltage_modbus_master::{crc16, ClientState, ExchangeLogger, MasterError};

#[derive(Default)]
struct Tables {
    holding_registers: HashMap<u16, u16>,
    input_registers: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
}

#[derive(Clone, Default)]
pub struct SlaveSimulator {
    tables: Arc<RwLock<Tables>>,
    forced_exception: Arc<Mutex<Option<u8>>>,
    silent: Arc<AtomicBool>,
    drop_next: Arc<AtomicBool>,
    requests: Arc<AtomicUsize>,
}

impl SlaveSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_holding(&self, start: u16, values: &[u16]) {
        let mut tables = self.tables.write().await;
        for (i, v) in values.iter().enumerate() {
            tables.holding_registers.insert(start + i as u16, *v);
        }
    }

    pub async fn set_input(&self, start: u16, values: &[u16]) {
        let mut tables = self.tables.write().await;
        for (i, v) in values.iter().enumerate() {
            tables.input_registers.insert(start + i as u16, *v);
        }
    }

    pub async fn set_coils(&self, start: u16, values: &[bool]) {
        let mut tables = self.tables.write().await;
        for (i, v) in values.iter().enumerate() {
            tables.coils.insert(start + i as u16, *v);
        }
    }

    pub async fn set_discrete(&self, start: u16, values: &[bool]) {
        let mut tables = self.tables.write().await;
        for (i, v) in values.iter().enumerate() {
            tables.discrete_inputs.insert(start + i as u16, *v);
        }
    }

    pub async fn holding(&self, start: u16, count: u16) -> Vec<u16> {
        let tables = self.tables.read().await;
        (start..start + count)
            .map(|a| tables.holding_registers.get(&a).copied().unwrap_or(0))
            .collect()
    }

    pub async fn coils(&self, start: u16, count: u16) -> Vec<bool> {
        let tables = self.tables.read().await;
        (start..start + count)
            .map(|a| tables.coils.get(&a).copied().unwrap_or(false))
            .collect()
    }

    /// Answer every request with this exception code until cleared
    pub fn force_exception(&self, code: Option<u8>) {
        *self.forced_exception.lock() = code;
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Close the connection instead of answering the next request
    pub fn drop_next_request(&self) {
        self.drop_next.store(true, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Transports
    // ========================================================================

    pub async fn start_tcp(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sim = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let sim = sim.clone();
                tokio::spawn(async move { sim.serve_tcp(stream).await });
            }
        });
        addr
    }

    async fn serve_tcp(&self, mut stream: TcpStream) {
        loop {
            let mut header = [0u8; 7];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut pdu = vec![0u8; length.saturating_sub(1)];
            if stream.read_exact(&mut pdu).await.is_err() {
                return;
            }
            let Some(reply) = self.respond(&pdu).await else {
                if self.drop_next.swap(false, Ordering::SeqCst) {
                    return;
                }
                continue;
            };

            let mut adu = Vec::with_capacity(7 + reply.len());
            adu.extend_from_slice(&header[..4]);
            adu.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
            adu.push(header[6]);
            adu.extend_from_slice(&reply);
            if stream.write_all(&adu).await.is_err() {
                return;
            }
        }
    }

    /// Serve RTU requests arriving on `stream` until it closes
    pub fn spawn_rtu<S>(&self, stream: S, unit_id: u8)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sim = self.clone();
        tokio::spawn(async move { sim.serve_rtu(stream, unit_id).await });
    }

    async fn serve_rtu<S>(&self, mut stream: S, unit_id: u8)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let mut frame = vec![0u8; 2];
            if stream.read_exact(&mut frame).await.is_err() {
                return;
            }
            let rest = match frame[1] {
                0x01..=0x06 => 6,
                0x0F | 0x10 => {
                    let mut head = [0u8; 5];
                    if stream.read_exact(&mut head).await.is_err() {
                        return;
                    }
                    frame.extend_from_slice(&head);
                    head[4] as usize + 2
                },
                _ => return,
            };
            let mut tail = vec![0u8; rest];
            if stream.read_exact(&mut tail).await.is_err() {
                return;
            }
            frame.extend_from_slice(&tail);

            let body_len = frame.len() - 2;
            let crc = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
            if crc != crc16(&frame[..body_len]) || frame[0] != unit_id {
                continue;
            }
            let Some(reply) = self.respond(&frame[1..body_len]).await else {
                if self.drop_next.swap(false, Ordering::SeqCst) {
                    return;
                }
                continue;
            };

            let mut adu = Vec::with_capacity(reply.len() + 3);
            adu.push(unit_id);
            adu.extend_from_slice(&reply);
            let crc = crc16(&adu);
            adu.extend_from_slice(&crc.to_le_bytes());
            if stream.write_all(&adu).await.is_err() {
                return;
            }
        }
    }

    // ========================================================================
    // PDU handling
    // ========================================================================

    async fn respond(&self, pdu: &[u8]) -> Option<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.drop_next.load(Ordering::SeqCst) || self.silent.load(Ordering::SeqCst) {
            return None;
        }
        let fc = pdu[0];
        if let Some(code) = *self.forced_exception.lock() {
            return Some(vec![fc | 0x80, code]);
        }

        let word = |i: usize| u16::from_be_bytes([pdu[i], pdu[i + 1]]);
        let (addr, qty) = (word(1), word(3));
        let mut tables = self.tables.write().await;
        let reply = match fc {
            0x01 | 0x02 => {
                let table = if fc == 0x01 {
                    &tables.coils
                } else {
                    &tables.discrete_inputs
                };
                let mut bytes = vec![0u8; (qty as usize).div_ceil(8)];
                for i in 0..qty {
                    if table.get(&(addr + i)).copied().unwrap_or(false) {
                        bytes[(i / 8) as usize] |= 1 << (i % 8);
                    }
                }
                let mut reply = vec![fc, bytes.len() as u8];
                reply.extend(bytes);
                reply
            },
            0x03 | 0x04 => {
                let table = if fc == 0x03 {
                    &tables.holding_registers
                } else {
                    &tables.input_registers
                };
                let mut reply = vec![fc, (qty * 2) as u8];
                for i in 0..qty {
                    let v = table.get(&(addr + i)).copied().unwrap_or(0);
                    reply.extend_from_slice(&v.to_be_bytes());
                }
                reply
            },
            0x05 => {
                tables.coils.insert(addr, qty == 0xFF00);
                pdu[..5].to_vec()
            },
            0x06 => {
                tables.holding_registers.insert(addr, qty);
                pdu[..5].to_vec()
            },
            0x0F => {
                for i in 0..qty {
                    let byte = pdu[6 + (i / 8) as usize];
                    tables.coils.insert(addr + i, byte & (1 << (i % 8)) != 0);
                }
                pdu[..5].to_vec()
            },
            0x10 => {
                for i in 0..qty as usize {
                    tables
                        .holding_registers
                        .insert(addr + i as u16, word(6 + i * 2));
                }
                pdu[..5].to_vec()
            },
            _ => vec![fc | 0x80, 0x01],
        };
        Some(reply)
    }
}

/// Logger that keeps every event for later assertions
#[derive(Default)]
pub struct RecordingLogger {
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub received: Mutex<Vec<Vec<u8>>>,
    pub transitions: Mutex<Vec<(ClientState, ClientState)>>,
    pub failures: Mutex<Vec<MasterError>>,
}

impl ExchangeLogger for RecordingLogger {
    fn frame_sent(&self, _unit_id: u8, adu: &[u8]) {
        self.sent.lock().push(adu.to_vec());
    }

    fn frame_received(&self, _unit_id: u8, adu: &[u8]) {
        self.received.lock().push(adu.to_vec());
    }

    fn state_changed(&self, from: ClientState, to: ClientState, _reason: &str) {
        self.transitions.lock().push((from, to));
    }

    fn transaction_failed(&self, _unit_id: u8, error: &MasterError) {
        self.failures.lock().push(error.clone());
    }
}
