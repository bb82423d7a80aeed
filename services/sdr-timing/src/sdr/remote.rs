//! Remote RTL-SDR over the rtl_tcp protocol
//!
//! The server sends a 12 byte header (`RTL0`, tuner type, gain count) and then
//! streams raw 8-bit IQ. Commands are 5 bytes: one command byte and a
//! big-endian u32 parameter.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

use super::args::DeviceArgs;
use super::block::{HardwareTimestamp, SampleBlock, SampleClock, SourceId};
use super::demod::IqTable;
use super::source::{check_rtl_tuning, ReadOutcome, SampleSource, SourceError, TuningParams};

const CMD_SET_FREQ: u8 = 0x01;
const CMD_SET_SAMPLE_RATE: u8 = 0x02;
const CMD_SET_GAIN_MODE: u8 = 0x03;
const CMD_SET_GAIN: u8 = 0x04;
const CMD_SET_FREQ_CORRECTION: u8 = 0x05;

const HEADER_LEN: usize = 12;

fn command(cmd: u8, param: u32) -> [u8; 5] {
    let p = param.to_be_bytes();
    [cmd, p[0], p[1], p[2], p[3]]
}

/// Header announced by an rtl_tcp server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DongleInfo {
    pub tuner_type: u32,
    pub gain_count: u32,
}

fn parse_header(header: &[u8; HEADER_LEN]) -> Option<DongleInfo> {
    if &header[..4] != b"RTL0" {
        return None;
    }
    Some(DongleInfo {
        tuner_type: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        gain_count: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
    })
}

/// RTL-SDR served by `rtl_tcp` on another host
pub struct RtlTcpSource {
    id: SourceId,
    tuning: TuningParams,
    peer: SocketAddr,
    stream: Option<TcpStream>,
    table: IqTable,
    buffer: Vec<u8>,
    odd_byte: Option<u8>,
    clock: SampleClock,
    discontinuity: bool,
}

impl RtlTcpSource {
    pub fn open(
        args: &DeviceArgs,
        tuning: TuningParams,
        connect_timeout: Duration,
    ) -> Result<Self, SourceError> {
        check_rtl_tuning(&tuning)?;

        let remote = args.get("remote").ok_or(super::args::ArgsError::Missing("remote"))?;
        let peer = remote
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SourceError::Unavailable(format!("cannot resolve {}", remote)))?;

        let mut stream = TcpStream::connect_timeout(&peer, connect_timeout)
            .map_err(|e| SourceError::Unavailable(format!("rtl_tcp at {}: {}", peer, e)))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(connect_timeout))?;

        let mut header = [0u8; HEADER_LEN];
        stream
            .read_exact(&mut header)
            .map_err(|e| SourceError::Unavailable(format!("rtl_tcp header from {}: {}", peer, e)))?;
        let dongle = parse_header(&header)
            .ok_or_else(|| SourceError::Unavailable(format!("{} is not an rtl_tcp server", peer)))?;

        info!(
            "Connected to rtl_tcp at {} (tuner type {}, {} gains)",
            peer, dongle.tuner_type, dongle.gain_count
        );

        stream.write_all(&command(CMD_SET_SAMPLE_RATE, tuning.sample_rate as u32))?;
        stream.write_all(&command(CMD_SET_FREQ, tuning.center_freq as u32))?;
        match tuning.gain_db {
            Some(gain) => {
                stream.write_all(&command(CMD_SET_GAIN_MODE, 1))?;
                stream.write_all(&command(CMD_SET_GAIN, (gain * 10.0).round() as u32))?;
            }
            None => stream.write_all(&command(CMD_SET_GAIN_MODE, 0))?,
        }
        let ppm: i32 = args.parse_param("ppm")?.unwrap_or(0);
        if ppm != 0 {
            stream.write_all(&command(CMD_SET_FREQ_CORRECTION, ppm as u32))?;
        }

        Ok(Self {
            id: args.source_id(),
            tuning,
            peer,
            stream: Some(stream),
            table: IqTable::new(),
            buffer: Vec::new(),
            odd_byte: None,
            clock: SampleClock::new(tuning.sample_rate),
            discontinuity: false,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl SampleSource for RtlTcpSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn tuning(&self) -> TuningParams {
        self.tuning
    }

    fn read_block(
        &mut self,
        max_samples: usize,
        timeout: Duration,
    ) -> Result<ReadOutcome, SourceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SourceError::Disconnected(format!("{} is closed", self.id)))?;

        // A zero read timeout means "block forever" to the socket
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let want = max_samples.max(1) * 2;
        self.buffer.resize(want, 0);
        let offset = match self.odd_byte.take() {
            Some(b) => {
                self.buffer[0] = b;
                1
            }
            None => 0,
        };

        let n_read = match stream.read(&mut self.buffer[offset..]) {
            Ok(0) => {
                return Err(SourceError::Disconnected(format!(
                    "rtl_tcp at {} closed the connection",
                    self.peer
                )))
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if offset == 1 {
                    self.odd_byte = Some(self.buffer[0]);
                }
                return Ok(ReadOutcome::Timeout);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if offset == 1 {
                    self.odd_byte = Some(self.buffer[0]);
                }
                return Ok(ReadOutcome::Timeout);
            }
            Err(e) => return Err(SourceError::Io(e)),
        };

        let total = offset + n_read;
        if total % 2 == 1 {
            self.odd_byte = Some(self.buffer[total - 1]);
        }
        let count = total / 2;
        if count == 0 {
            return Ok(ReadOutcome::Timeout);
        }

        let arrival = HardwareTimestamp::host_now();
        self.clock.anchor_at(arrival, count as u64);

        let mut samples = Vec::with_capacity(count);
        self.table.extend_samples(&self.buffer[..count * 2], &mut samples);
        let (sequence, timestamp) = self.clock.stamp(count);

        debug!("[{}] read {} samples", self.id, count);

        Ok(ReadOutcome::Block(
            SampleBlock::new(
                self.id.clone(),
                self.tuning.sample_rate,
                self.tuning.center_freq,
                sequence,
                timestamp,
                samples,
            )
            .with_discontinuity(std::mem::take(&mut self.discontinuity)),
        ))
    }

    fn retune(&mut self, center_freq: f64) -> Result<(), SourceError> {
        let tuning = TuningParams {
            center_freq,
            ..self.tuning
        };
        check_rtl_tuning(&tuning)?;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SourceError::Disconnected(format!("{} is closed", self.id)))?;
        stream.write_all(&command(CMD_SET_FREQ, center_freq as u32))?;

        self.tuning = tuning;
        self.odd_byte = None;
        self.clock.reanchor();
        self.discontinuity = true;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!("[{}] rtl_tcp connection closed", self.id);
        }
    }
}

impl Drop for RtlTcpSource {
    fn drop(&mut self) {
        self.close();
    }
}
