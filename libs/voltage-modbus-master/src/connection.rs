//! Transport session: one open byte stream to a slave
//!
//! Owns a TCP socket or serial line, writes request frames and waits for the
//! matching response until a deadline. TCP responses are matched by
//! transaction ID; RTU responses by unit and function code, with the frame
//! length derived from the function code.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::EndpointConfig;
use crate::constants::{
    MAX_MBAP_LENGTH, MAX_RTU_FRAME_SIZE, MBAP_PREFIX_LEN, RTU_INTER_FRAME_GAP,
};
use crate::error::{MasterError, Result};
use crate::pdu::{FunctionCode, ModbusPdu, EXCEPTION_FLAG};
use crate::transport::{rtu_response_length, Framing, ModbusFrameProcessor, ParsedAdu};
use crate::types::TransportKind;

/// Any async byte stream a session can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// The request a session is waiting on
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    pub adu: Vec<u8>,
    pub framing: Framing,
    pub unit_id: u8,
    pub function: FunctionCode,
}

/// A correlated response: raw wire bytes plus the parsed frame
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub raw: Vec<u8>,
    pub adu: ParsedAdu,
}

pub struct TransportSession {
    stream: Option<Box<dyn ByteStream>>,
    processor: ModbusFrameProcessor,
    request_timeout: Duration,
    peer: String,
    rx_buf: Vec<u8>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("kind", &self.processor.kind())
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

impl TransportSession {
    /// Open the endpoint; the connect itself is bounded by `request_timeout`
    pub async fn open(endpoint: &EndpointConfig, request_timeout: Duration) -> Result<Self> {
        endpoint.validate()?;
        let stream: Box<dyn ByteStream> = match endpoint {
            EndpointConfig::Tcp(tcp) => {
                Box::new(connect_tcp(&tcp.host, tcp.port, request_timeout).await?)
            },
            EndpointConfig::Rtu(rtu) => open_serial(rtu)?,
        };
        Ok(Self::from_boxed(
            stream,
            endpoint.kind(),
            request_timeout,
            endpoint.to_string(),
        ))
    }

    /// Run a session over a stream the caller already opened
    pub fn attach(
        stream: impl ByteStream + 'static,
        kind: TransportKind,
        request_timeout: Duration,
        peer: impl Into<String>,
    ) -> Self {
        Self::from_boxed(Box::new(stream), kind, request_timeout, peer.into())
    }

    fn from_boxed(
        stream: Box<dyn ByteStream>,
        kind: TransportKind,
        request_timeout: Duration,
        peer: String,
    ) -> Self {
        Self {
            stream: Some(stream),
            processor: ModbusFrameProcessor::new(kind),
            request_timeout,
            peer,
            rx_buf: Vec::with_capacity(MAX_RTU_FRAME_SIZE * 2),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.processor.kind()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn set_request_timeout(&mut self, request_timeout: Duration) {
        self.request_timeout = request_timeout;
    }

    /// Frame `pdu` for `unit_id`, consuming the next transaction ID on TCP
    pub fn prepare(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Result<OutstandingRequest> {
        let function = FunctionCode::try_from(
            pdu.function_code()
                .ok_or_else(|| MasterError::invalid_input("empty request PDU"))?,
        )?;
        let (adu, framing) = self.processor.build_request(unit_id, pdu);
        Ok(OutstandingRequest {
            adu,
            framing,
            unit_id,
            function,
        })
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        // a late RTU reply to an abandoned request carries nothing to correlate it
        if self.kind() == TransportKind::Rtu {
            self.rx_buf.clear();
        }
        let kind = self.kind();
        let stream = self.stream.as_mut().ok_or(MasterError::NotConnected)?;
        stream.write_all(bytes).await.map_err(|e| {
            error!("{:?} TX: {}", kind, e);
            MasterError::connection(format!("send failed: {e}"))
        })?;
        stream.flush().await.map_err(|e| {
            error!("{:?} flush: {}", kind, e);
            MasterError::connection(format!("flush failed: {e}"))
        })?;
        debug!("{:?} TX: {}B", kind, bytes.len());
        Ok(())
    }

    /// Wait for the response to `request` for at most `wait`
    ///
    /// Frames that belong to some other request are discarded, valid or not,
    /// and the wait continues. The session stays open when the deadline
    /// passes; a partially received frame is dropped at that point.
    pub async fn receive(
        &mut self,
        request: &OutstandingRequest,
        wait: Duration,
    ) -> Result<ResponseFrame> {
        let deadline = Instant::now() + wait;
        loop {
            let frame = match self.kind() {
                TransportKind::Tcp => self.read_tcp_frame(request, deadline).await,
                TransportKind::Rtu => self.read_rtu_frame(request, deadline).await,
            };
            let raw = match frame {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    if matches!(e, MasterError::Timeout(_)) && !self.rx_buf.is_empty() {
                        debug!("Dropped {}B incomplete frame", self.rx_buf.len());
                        self.rx_buf.clear();
                    }
                    return Err(e);
                },
            };
            if !Self::addressed_to(request, &raw) {
                warn!(
                    "Discarded {:?} frame not for this request: {}",
                    self.kind(),
                    hex::encode_upper(&raw)
                );
                continue;
            }
            let adu = self.processor.parse_response(&raw)?;
            debug!("{:?} RX: {}B", self.kind(), raw.len());
            return Ok(ResponseFrame { raw, adu });
        }
    }

    /// Send `request` and wait for its response within the session timeout
    pub async fn transact(&mut self, request: &OutstandingRequest) -> Result<ResponseFrame> {
        self.send(&request.adu).await?;
        let wait = self.request_timeout;
        self.receive(request, wait).await
    }

    /// Release the stream; safe to call repeatedly
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown {}: {}", self.peer, e);
            }
            info!("Closed: {}", self.peer);
        }
        self.rx_buf.clear();
    }

    /// Correlation on the raw header, before the frame itself is validated
    fn addressed_to(request: &OutstandingRequest, raw: &[u8]) -> bool {
        match request.framing {
            Framing::Tcp { transaction_id } => {
                raw.len() >= 2 && u16::from_be_bytes([raw[0], raw[1]]) == transaction_id
            },
            Framing::Rtu => match raw {
                [unit, fc, ..] => {
                    *unit == request.unit_id
                        && (*fc == request.function.code()
                            || *fc == request.function.exception_code())
                },
                _ => false,
            },
        }
    }

    async fn fill(&mut self, deadline: Instant) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(MasterError::NotConnected)?;
        let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];
        let n = timeout_at(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| MasterError::timeout("no response before deadline"))?
            .map_err(|e| {
                error!("RX: {}", e);
                MasterError::connection(format!("receive failed: {e}"))
            })?;
        if n == 0 {
            error!("Peer closed: {}", self.peer);
            return Err(MasterError::connection("connection closed by peer"));
        }
        self.rx_buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// [TID(2)][PID(2)][Length(2)][Unit(1)][PDU]
    ///
    /// `None` when an undelimitable header for another transaction was
    /// skipped; the buffer then resumes at the next plausible MBAP header.
    async fn read_tcp_frame(
        &mut self,
        request: &OutstandingRequest,
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>> {
        loop {
            if self.rx_buf.len() >= MBAP_PREFIX_LEN {
                let length = u16::from_be_bytes([self.rx_buf[4], self.rx_buf[5]]) as usize;
                if length == 0 || length > MAX_MBAP_LENGTH {
                    if Self::addressed_to(request, &self.rx_buf) {
                        self.rx_buf.clear();
                        error!("TCP invalid len: {}", length);
                        return Err(MasterError::protocol(format!(
                            "Invalid TCP frame length: {length}"
                        )));
                    }
                    let last_start = self.rx_buf.len() - MBAP_PREFIX_LEN;
                    let skip = (1..=last_start)
                        .find(|&k| plausible_mbap(&self.rx_buf[k..]))
                        .unwrap_or(last_start + 1);
                    warn!("TCP invalid len: {}, skipped {}B", length, skip);
                    self.rx_buf.drain(..skip);
                    return Ok(None);
                }
                let total = MBAP_PREFIX_LEN + length;
                if self.rx_buf.len() >= total {
                    return Ok(Some(self.rx_buf.drain(..total).collect()));
                }
            }
            self.fill(deadline).await?;
        }
    }

    /// [Unit(1)][PDU][CRC(2)], length inferred from the function code
    async fn read_rtu_frame(
        &mut self,
        request: &OutstandingRequest,
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(total) = rtu_response_length(&self.rx_buf) {
                if self.rx_buf.len() >= total {
                    return Ok(Some(self.rx_buf.drain(..total).collect()));
                }
            } else if self.rx_buf.len() >= 2 && !Self::known_rtu_function(self.rx_buf[1]) {
                // line noise: slide forward one byte and resynchronise
                debug!("RTU resync: dropped {:02X}", self.rx_buf[0]);
                self.rx_buf.remove(0);
                continue;
            }

            if self.rx_buf.is_empty() {
                self.fill(deadline).await?;
                continue;
            }

            // mid-frame: a gap longer than the inter-frame silence ends it
            let gap_deadline = (Instant::now() + RTU_INTER_FRAME_GAP).min(deadline);
            match self.fill(gap_deadline).await {
                Ok(()) => {},
                Err(MasterError::Timeout(_)) if Instant::now() < deadline => {
                    warn!(
                        "RTU partial frame dropped: {}B for unit {}",
                        self.rx_buf.len(),
                        request.unit_id
                    );
                    self.rx_buf.clear();
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn known_rtu_function(fc: u8) -> bool {
        fc & EXCEPTION_FLAG != 0 || FunctionCode::try_from(fc).is_ok()
    }
}

/// PID 0 and a length the MBAP header allows
fn plausible_mbap(header: &[u8]) -> bool {
    match header {
        [_, _, 0, 0, hi, lo, ..] => {
            let length = u16::from_be_bytes([*hi, *lo]) as usize;
            (1..=MAX_MBAP_LENGTH).contains(&length)
        },
        _ => false,
    }
}

async fn connect_tcp(host: &str, port: u16, timeout_duration: Duration) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    debug!("TCP connecting: {}", addr);

    match timeout(timeout_duration, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("TCP_NODELAY: {}", e);
            }
            info!("TCP connected: {}", addr);
            Ok(stream)
        },
        Ok(Err(e)) => {
            error!("TCP err: {} - {}", addr, e);
            Err(MasterError::connection(format!(
                "Failed to connect to {addr}: {e}"
            )))
        },
        Err(_) => {
            warn!("TCP timeout: {}", addr);
            Err(MasterError::connection(format!(
                "Connection to {addr} timed out"
            )))
        },
    }
}

#[cfg(feature = "rtu")]
fn open_serial(rtu: &crate::config::RtuEndpoint) -> Result<Box<dyn ByteStream>> {
    use crate::types::Parity;
    use tokio_serial::SerialPortBuilderExt;

    debug!("RTU: {} @{}baud", rtu.device, rtu.baud_rate);

    let parity = match rtu.parity {
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::None => tokio_serial::Parity::None,
    };
    let data_bits = match rtu.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match rtu.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    match tokio_serial::new(&rtu.device, rtu.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()
    {
        Ok(port) => {
            info!("RTU opened: {}", rtu.device);
            Ok(Box::new(port))
        },
        Err(e) => {
            error!("RTU err: {} - {}", rtu.device, e);
            Err(MasterError::connection(format!(
                "Failed to open serial port {}: {e}",
                rtu.device
            )))
        },
    }
}

#[cfg(not(feature = "rtu"))]
fn open_serial(rtu: &crate::config::RtuEndpoint) -> Result<Box<dyn ByteStream>> {
    Err(MasterError::config(format!(
        "serial support not compiled in, cannot open {}",
        rtu.device
    )))
}
