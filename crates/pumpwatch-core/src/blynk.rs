//! App-telemetry uplink speaking the legacy Blynk TCP protocol.
//!
//! Frames are `cmd:u8, msg_id:u16be, length:u16be` followed by a body of
//! NUL-separated fields. For RESPONSE frames the length field carries the
//! status code instead. A spawned connection task owns the socket,
//! answers server pings, sends keep-alive pings and reconnects with
//! backoff; the sink hands it commands over a bounded channel.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::classify::{Band, BolusSignal, DerivedStatus, Severity};
use crate::config::BlynkConfig;
use crate::snapshot::CorrectedSnapshot;
use crate::uplink::{UploadSink, UplinkError};

const CMD_RESPONSE: u8 = 0;
const CMD_LOGIN: u8 = 2;
const CMD_PING: u8 = 6;
const CMD_PROPERTY: u8 = 19;
const CMD_HARDWARE: u8 = 20;

const STATUS_SUCCESS: u16 = 200;

// Virtual channel assignment, fixed by the companion app layout.
const VPIN_SENSOR: u8 = 1;
const VPIN_BATTERY: u8 = 2;
const VPIN_UNITS: u8 = 3;
const VPIN_ARROWS: u8 = 4;
const VPIN_STATUS: u8 = 5;
const VPIN_ACTINS: u8 = 6;
const VPIN_LASTBOLUS: u8 = 7;

const COLOR_WHITE: &str = "#F0F0F0";
const COLOR_GREEN: &str = "#23C48E";
const COLOR_BLUE: &str = "#04C0F8";
const COLOR_YELLOW: &str = "#ED9D00";
const COLOR_RED: &str = "#D3435C";

const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(60);

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Normal => COLOR_GREEN,
        Severity::PreAlert => COLOR_YELLOW,
        Severity::Alert => COLOR_RED,
        Severity::Suspended => COLOR_BLUE,
        Severity::SensorFault => COLOR_WHITE,
    }
}

fn band_color(band: Band) -> &'static str {
    match band {
        Band::Normal => COLOR_GREEN,
        Band::Warning => COLOR_YELLOW,
        Band::Critical => COLOR_RED,
    }
}

fn encode_frame(cmd: u8, msg_id: u16, fields: &[&str]) -> Vec<u8> {
    let body = fields.join("\0");
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(cmd);
    frame.extend_from_slice(&msg_id.to_be_bytes());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(body.as_bytes());
    frame
}

fn encode_response(msg_id: u16, status: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5);
    frame.push(CMD_RESPONSE);
    frame.extend_from_slice(&msg_id.to_be_bytes());
    frame.extend_from_slice(&status.to_be_bytes());
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    cmd: u8,
    msg_id: u16,
    /// Body length, or the status code for RESPONSE frames.
    field: u16,
}

fn parse_header(bytes: &[u8; 5]) -> FrameHeader {
    FrameHeader {
        cmd: bytes[0],
        msg_id: u16::from_be_bytes([bytes[1], bytes[2]]),
        field: u16::from_be_bytes([bytes[3], bytes[4]]),
    }
}

/// Incremental frame extraction from a receive buffer. Returns the
/// headers of complete frames and drains their bytes; bodies are read
/// past (the gateway pushes values, it never consumes app events).
fn drain_frames(buf: &mut Vec<u8>) -> Vec<FrameHeader> {
    let mut frames = Vec::new();
    loop {
        if buf.len() < 5 {
            return frames;
        }
        let header = parse_header(&[buf[0], buf[1], buf[2], buf[3], buf[4]]);
        let body_len = match header.cmd {
            // RESPONSE and PING carry no body.
            CMD_RESPONSE | CMD_PING => 0,
            _ => header.field as usize,
        };
        if buf.len() < 5 + body_len {
            return frames;
        }
        buf.drain(..5 + body_len);
        frames.push(header);
    }
}

#[derive(Debug)]
enum BlynkCommand {
    VirtualWrite { pin: u8, value: String },
    SetProperty { pin: u8, prop: &'static str, value: String },
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Session {
    reader: tokio::net::tcp::OwnedReadHalf,
    writer: tokio::net::tcp::OwnedWriteHalf,
    msg_id: u16,
    rx_buf: Vec<u8>,
}

impl Session {
    async fn login(addr: &str, token: &str) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut session = Session {
            reader,
            writer,
            msg_id: 0,
            rx_buf: Vec::new(),
        };

        let login = encode_frame(CMD_LOGIN, session.next_id(), &[token]);
        session.writer.write_all(&login).await?;

        // The login answer is the first frame the server sends.
        loop {
            if let Some(header) = drain_frames(&mut session.rx_buf).into_iter().next() {
                if header.cmd == CMD_RESPONSE && header.field == STATUS_SUCCESS {
                    return Ok(session);
                }
                return Err(std::io::Error::other(format!(
                    "login rejected with status {}",
                    header.field
                )));
            }
            let mut chunk = [0_u8; 256];
            let n = session.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::Error::other("server closed during login"));
            }
            session.rx_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn next_id(&mut self) -> u16 {
        self.msg_id = self.msg_id.checked_add(1).unwrap_or(1);
        self.msg_id
    }

    async fn send_command(&mut self, command: &BlynkCommand) -> Result<(), std::io::Error> {
        let frame = match command {
            BlynkCommand::VirtualWrite { pin, value } => {
                let pin = pin.to_string();
                encode_frame(CMD_HARDWARE, self.next_id(), &["vw", &pin, value])
            }
            BlynkCommand::SetProperty { pin, prop, value } => {
                let pin = pin.to_string();
                encode_frame(CMD_PROPERTY, self.next_id(), &[&pin, prop, value])
            }
            BlynkCommand::Shutdown => return Ok(()),
        };
        self.writer.write_all(&frame).await
    }

    async fn run(
        &mut self,
        rx: &mut mpsc::Receiver<BlynkCommand>,
        heartbeat: Duration,
    ) -> SessionEnd {
        let mut ping_timer = tokio::time::interval(heartbeat);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.reset();
        let mut chunk = [0_u8; 256];

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        return SessionEnd::Shutdown;
                    };
                    if matches!(command, BlynkCommand::Shutdown) {
                        return SessionEnd::Shutdown;
                    }
                    if let Err(err) = self.send_command(&command).await {
                        return SessionEnd::Lost(err.to_string());
                    }
                }
                read = self.reader.read(&mut chunk) => {
                    match read {
                        Ok(0) => return SessionEnd::Lost("server closed connection".to_string()),
                        Ok(n) => {
                            self.rx_buf.extend_from_slice(&chunk[..n]);
                            for header in drain_frames(&mut self.rx_buf) {
                                if header.cmd == CMD_PING {
                                    let pong = encode_response(header.msg_id, STATUS_SUCCESS);
                                    if let Err(err) = self.writer.write_all(&pong).await {
                                        return SessionEnd::Lost(err.to_string());
                                    }
                                } else {
                                    debug!(cmd = header.cmd, "ignoring app frame");
                                }
                            }
                        }
                        Err(err) => return SessionEnd::Lost(err.to_string()),
                    }
                }
                _ = ping_timer.tick() => {
                    let ping = encode_frame(CMD_PING, self.next_id(), &[]);
                    if let Err(err) = self.writer.write_all(&ping).await {
                        return SessionEnd::Lost(err.to_string());
                    }
                }
            }
        }
    }
}

async fn connection_task(config: BlynkConfig, mut rx: mpsc::Receiver<BlynkCommand>) {
    let addr = if config.server.contains(':') {
        config.server.clone()
    } else {
        format!("{}:80", config.server)
    };
    let heartbeat = Duration::from_secs(config.heartbeat.max(1));
    let mut backoff = Duration::from_secs(1);

    loop {
        match Session::login(&addr, &config.token).await {
            Ok(mut session) => {
                info!(server = %addr, "connected to cloud server");
                backoff = Duration::from_secs(1);
                match session.run(&mut rx, heartbeat).await {
                    SessionEnd::Shutdown => {
                        info!("disconnecting from cloud server");
                        return;
                    }
                    SessionEnd::Lost(reason) => {
                        warn!(%reason, "disconnected from cloud server");
                    }
                }
            }
            Err(err) => {
                warn!(server = %addr, error = %err, "cloud connection failed");
            }
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
    }
}

/// The app-telemetry sink. Writes each derived field to its virtual
/// channel with a color tag; commands are queued to the connection task
/// and dropped with an error when the queue is saturated, so a dead
/// cloud link can never stall a cycle.
pub struct BlynkUplink {
    tx: mpsc::Sender<BlynkCommand>,
}

impl BlynkUplink {
    pub fn spawn(config: BlynkConfig) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(connection_task(config, rx));
        Self { tx }
    }

    fn enqueue(&self, command: BlynkCommand) -> Result<(), UplinkError> {
        self.tx
            .try_send(command)
            .map_err(|err| UplinkError::ConnectionLost(err.to_string()))
    }

    fn virtual_write(&self, pin: u8, value: impl ToString) -> Result<(), UplinkError> {
        self.enqueue(BlynkCommand::VirtualWrite {
            pin,
            value: value.to_string(),
        })
    }

    fn set_property(
        &self,
        pin: u8,
        prop: &'static str,
        value: impl ToString,
    ) -> Result<(), UplinkError> {
        self.enqueue(BlynkCommand::SetProperty {
            pin,
            prop,
            value: value.to_string(),
        })
    }
}

#[async_trait]
impl UploadSink for BlynkUplink {
    fn name(&self) -> &'static str {
        "blynk"
    }

    async fn push(
        &mut self,
        snapshot: &CorrectedSnapshot,
        derived: &DerivedStatus,
    ) -> Result<(), UplinkError> {
        debug!("uploading data to blynk");

        // Sensor gauge and status line.
        match snapshot.sensor_bgl.value() {
            Some(bgl) => {
                self.virtual_write(VPIN_SENSOR, bgl)?;
                self.set_property(VPIN_SENSOR, "color", severity_color(derived.severity))?;
                self.set_property(VPIN_STATUS, "color", COLOR_GREEN)?;
            }
            None => {
                // Exception: blank the gauge, fault-colored status.
                self.virtual_write(VPIN_SENSOR, "")?;
                self.set_property(VPIN_SENSOR, "color", COLOR_WHITE)?;
                self.set_property(VPIN_STATUS, "color", COLOR_RED)?;
            }
        }
        self.virtual_write(VPIN_ARROWS, &derived.trend_text)?;
        self.virtual_write(VPIN_STATUS, &derived.status_text)?;

        // Alternating battery gauge.
        self.set_property(VPIN_BATTERY, "label", derived.battery.label)?;
        self.virtual_write(VPIN_BATTERY, derived.battery.percent)?;
        self.set_property(VPIN_BATTERY, "color", band_color(derived.battery.band))?;

        // Reservoir gauge.
        self.virtual_write(VPIN_UNITS, derived.reservoir_units)?;
        self.set_property(VPIN_UNITS, "color", band_color(derived.reservoir_band))?;

        // Bolus / active-insulin graph.
        match derived.bolus {
            BolusSignal::RecentBolus(amount) => self.virtual_write(VPIN_LASTBOLUS, amount)?,
            BolusSignal::ActiveInsulin(value) => self.virtual_write(VPIN_ACTINS, value)?,
            BolusSignal::Quiet => {}
        }

        Ok(())
    }

    async fn push_outage(&mut self) -> Result<(), UplinkError> {
        self.set_property(VPIN_STATUS, "color", COLOR_RED)
    }

    async fn shutdown(&mut self) {
        // try_send: a task stuck reconnecting must not hold up process exit.
        let _ = self.tx.try_send(BlynkCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_frame_layout() {
        let frame = encode_frame(CMD_HARDWARE, 7, &["vw", "1", "105"]);
        assert_eq!(frame[0], CMD_HARDWARE);
        assert_eq!(u16::from_be_bytes([frame[1], frame[2]]), 7);
        assert_eq!(u16::from_be_bytes([frame[3], frame[4]]), 8);
        assert_eq!(&frame[5..], b"vw\x001\x00105");
    }

    #[test]
    fn response_frame_carries_status_in_length_field() {
        let frame = encode_response(3, STATUS_SUCCESS);
        let header = parse_header(&[frame[0], frame[1], frame[2], frame[3], frame[4]]);
        assert_eq!(header.cmd, CMD_RESPONSE);
        assert_eq!(header.msg_id, 3);
        assert_eq!(header.field, STATUS_SUCCESS);
    }

    #[test]
    fn drain_frames_handles_partial_and_bodied_frames() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_response(1, STATUS_SUCCESS));
        buf.extend_from_slice(&encode_frame(CMD_HARDWARE, 2, &["vw", "4", "x"]));
        // Trailing partial header must stay buffered.
        buf.push(CMD_PING);

        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].cmd, CMD_RESPONSE);
        assert_eq!(frames[1].cmd, CMD_HARDWARE);
        assert_eq!(buf, vec![CMD_PING]);
    }

    #[test]
    fn ping_frames_have_no_body() {
        let mut buf = encode_frame(CMD_PING, 9, &[]);
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cmd, CMD_PING);
        assert!(buf.is_empty());
    }

    #[test]
    fn message_ids_skip_zero_on_wrap() {
        assert_eq!(0u16.checked_add(1).unwrap_or(1), 1);
        assert_eq!(u16::MAX.checked_add(1).unwrap_or(1), 1);
    }
}
