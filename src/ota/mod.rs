//! Over-the-air firmware delivery.
//!
//! A `Flasher` drives one update across a device session it has taken
//! ownership of. After `UpdateBegin` is acknowledged the transfer runs in
//! one of two modes: slow OTA acknowledges every chunk, fast OTA pipelines
//! the whole image and the device reports only the chunks it missed.
//! Every chunk carries its CRC32; the final short chunk is zero-padded to
//! the negotiated size because device firmware requires fixed-size chunks.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{OtaError, Result, SessionError};
use crate::protocol::{checksum, MessageName};
use crate::server::{DeviceSession, MessageParams, SessionEvent};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u16 = 256;

/// Largest chunk size device firmware accepts.
pub const MAX_CHUNK_SIZE: u16 = 594;

/// Outstanding missed chunks beyond this tear the update down.
pub const MAX_MISSED_CHUNKS: usize = 10;

/// Waits between `UpdateBegin` attempts: three short, one long.
const BEGIN_WAITS: [Duration; 4] = [
    Duration::from_secs(6),
    Duration::from_secs(6),
    Duration::from_secs(6),
    Duration::from_secs(90),
];

/// Settle time before and between missed-chunk recovery rounds.
const DRAIN_WAIT: Duration = Duration::from_secs(3);

/// Missed-chunk recovery rounds before giving up.
const DRAIN_ROUNDS: usize = 3;

/// Flasher tuning.
#[derive(Debug, Clone)]
pub struct OtaConfig {
    /// Chunk size in bytes, at most [`MAX_CHUNK_SIZE`].
    pub chunk_size: u16,
    /// Offer fast (pipelined) OTA; the device's `UpdateReady` decides.
    pub fast_ota: bool,
    /// In slow mode, acknowledge but do not collect missed-chunk reports.
    pub ignore_missed_chunks: bool,
    /// Bound on the whole update.
    pub global_timeout: Duration,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fast_ota: true,
            ignore_missed_chunks: false,
            global_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&crate::config::OtaSettings> for OtaConfig {
    fn from(settings: &crate::config::OtaSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            fast_ota: settings.fast_ota,
            ..Default::default()
        }
    }
}

/// One firmware update over one session.
///
/// Construct per update and discard afterwards; the session survives.
pub struct Flasher {
    session: Arc<DeviceSession>,
    config: OtaConfig,
}

impl Flasher {
    pub fn new(session: Arc<DeviceSession>, config: OtaConfig) -> Self {
        Self { session, config }
    }

    /// Deliver `firmware` to the device.
    ///
    /// Claims session ownership for the duration; releases it and drops all
    /// transfer state on every exit path, success or failure.
    pub async fn flash(&self, firmware: &[u8]) -> Result<()> {
        if firmware.is_empty() {
            return Err(OtaError::EmptyImage.into());
        }

        let owner = format!("flasher-{}", self.session.connection_key());
        if !self.session.take_ownership(&owner) {
            return Err(OtaError::ClaimDenied.into());
        }

        let missed: Arc<Mutex<BTreeSet<u16>>> = Arc::new(Mutex::new(BTreeSet::new()));
        let flood = Arc::new(AtomicBool::new(false));
        let fast_mode = Arc::new(AtomicBool::new(false));

        let collector = tokio::spawn(collect_missed(
            Arc::clone(&self.session),
            Arc::clone(&missed),
            Arc::clone(&flood),
            Arc::clone(&fast_mode),
            self.config.ignore_missed_chunks,
        ));

        let result = timeout(
            self.config.global_timeout,
            self.run(firmware, &owner, &missed, &flood, &fast_mode),
        )
        .await;

        // Single cleanup point for every exit path.
        collector.abort();
        self.session.release_ownership(&owner);

        match result {
            Ok(inner) => inner,
            Err(_) => Err(OtaError::Timeout.into()),
        }
    }

    async fn run(
        &self,
        firmware: &[u8],
        owner: &str,
        missed: &Mutex<BTreeSet<u16>>,
        flood: &AtomicBool,
        fast_mode: &AtomicBool,
    ) -> Result<()> {
        let chunk_size = usize::from(self.config.chunk_size.min(MAX_CHUNK_SIZE));
        let chunk_count = firmware.len().div_ceil(chunk_size);

        let protocol_version = self.begin(firmware.len(), owner).await?;
        let fast = self.config.fast_ota && protocol_version > 0;
        fast_mode.store(fast, Ordering::SeqCst);

        info!(
            device_id = %self.session.device_id(),
            bytes = firmware.len(),
            chunks = chunk_count,
            fast,
            protocol_version,
            "update started"
        );

        // First pass, in index order.
        for index in 0..chunk_count {
            if flood.load(Ordering::SeqCst) {
                return Err(flood_error(missed));
            }
            let index = index as u16;
            let chunk = chunk_at(firmware, index, chunk_size)
                .expect("index bounded by chunk count");
            self.send_chunk(&chunk, index, fast, owner).await?;
        }

        // Recovery: give stragglers a moment, then re-send what the device
        // reports missing, a bounded number of rounds.
        if fast {
            sleep(DRAIN_WAIT).await;
        }
        for _ in 0..DRAIN_ROUNDS {
            if flood.load(Ordering::SeqCst) {
                return Err(flood_error(missed));
            }
            let batch: Vec<u16> = {
                let mut set = missed.lock();
                let batch = set.iter().copied().collect();
                set.clear();
                batch
            };
            if batch.is_empty() {
                break;
            }
            debug!(chunks = batch.len(), "re-sending missed chunks");
            for index in batch {
                let Some(chunk) = chunk_at(firmware, index, chunk_size) else {
                    warn!(index, "device reported a chunk index past the image end");
                    continue;
                };
                self.send_chunk(&chunk, index, fast, owner).await?;
            }
            sleep(DRAIN_WAIT).await;
        }

        // Finish.
        let sent = self.session.send_message(
            MessageName::UpdateDone,
            MessageParams::default(),
            Some(owner),
        );
        if !sent {
            return Err(SessionError::Closed.into());
        }

        info!(device_id = %self.session.device_id(), "update complete");
        Ok(())
    }

    /// Send `UpdateBegin` and wait for the device's verdict, on the
    /// three-short-one-long retry schedule.
    ///
    /// Returns the negotiated protocol version from `UpdateReady`.
    async fn begin(&self, file_size: usize, owner: &str) -> Result<u8> {
        let flags: u8 = u8::from(self.config.fast_ota); // bit 0: fast OTA supported
        let chunk_size = self.config.chunk_size.min(MAX_CHUNK_SIZE);

        let mut payload = Vec::with_capacity(12);
        payload.push(flags);
        payload.extend_from_slice(&chunk_size.to_be_bytes());
        payload.extend_from_slice(&(file_size as u32).to_be_bytes());
        payload.push(0); // dest flag
        payload.extend_from_slice(&0u32.to_be_bytes()); // dest address

        for wait in BEGIN_WAITS {
            let token = self.session.alloc_token();
            let ready =
                self.session
                    .listen_for(MessageName::UpdateReady, None, Some(token.clone()));
            let abort =
                self.session
                    .listen_for(MessageName::UpdateAbort, None, Some(token.clone()));

            let sent = self.session.send_message(
                MessageName::UpdateBegin,
                MessageParams {
                    token: Some(token),
                    payload: payload.clone(),
                    ..Default::default()
                },
                Some(owner),
            );
            if !sent {
                return Err(SessionError::Closed.into());
            }

            tokio::select! {
                ready = ready => {
                    let msg = ready?;
                    return Ok(msg.payload.first().copied().unwrap_or(0));
                }
                abort = abort => {
                    let msg = abort?;
                    let reason = msg.payload.first().copied().unwrap_or(0);
                    return Err(OtaError::Aborted(reason).into());
                }
                _ = sleep(wait) => {
                    debug!("update begin unanswered, retrying");
                }
            }
        }

        Err(OtaError::BeginTimeout.into())
    }

    /// Send one chunk; in slow mode, wait for its acknowledgement.
    async fn send_chunk(&self, chunk: &[u8], index: u16, fast: bool, owner: &str) -> Result<()> {
        let crc = checksum(chunk);
        let mut queries = vec![crc.to_be_bytes().to_vec()];
        if fast {
            queries.push(index.to_be_bytes().to_vec());
        }

        let token = self.session.alloc_token();
        let received = (!fast).then(|| {
            self.session
                .listen_for(MessageName::ChunkReceived, None, Some(token.clone()))
        });

        let sent = self.session.send_message(
            MessageName::Chunk,
            MessageParams {
                uri_segment: None,
                queries,
                token: Some(token),
                payload: chunk.to_vec(),
            },
            Some(owner),
        );
        if !sent {
            return Err(SessionError::Closed.into());
        }

        if let Some(received) = received {
            let msg = received.await?;
            if !msg.code.is_success() {
                return Err(OtaError::ChunkReceivedFail { index }.into());
            }
        }

        Ok(())
    }
}

/// Slice one zero-padded chunk out of the image.
fn chunk_at(firmware: &[u8], index: u16, chunk_size: usize) -> Option<Vec<u8>> {
    let start = usize::from(index) * chunk_size;
    if start >= firmware.len() {
        return None;
    }
    let end = (start + chunk_size).min(firmware.len());
    let mut chunk = firmware[start..end].to_vec();
    chunk.resize(chunk_size, 0);
    Some(chunk)
}

fn flood_error(missed: &Mutex<BTreeSet<u16>>) -> crate::Error {
    OtaError::MissedChunkFlood {
        count: missed.lock().len(),
        max: MAX_MISSED_CHUNKS,
    }
    .into()
}

/// Ack every `ChunkMissed` immediately, then record the indexes it names.
async fn collect_missed(
    session: Arc<DeviceSession>,
    missed: Arc<Mutex<BTreeSet<u16>>>,
    flood: Arc<AtomicBool>,
    fast_mode: Arc<AtomicBool>,
    ignore_missed_chunks: bool,
) {
    let mut events = session.events();
    loop {
        match events.recv().await {
            Ok(SessionEvent::ChunkMissed(msg)) => {
                session.send_reply(
                    MessageName::ChunkMissedAck,
                    msg.message_id,
                    Some(msg.token.clone()),
                    Vec::new(),
                );

                if !fast_mode.load(Ordering::SeqCst) && ignore_missed_chunks {
                    continue;
                }

                let mut set = missed.lock();
                for pair in msg.payload.chunks_exact(2) {
                    set.insert(u16::from_be_bytes([pair[0], pair[1]]));
                }
                if set.len() > MAX_MISSED_CHUNKS {
                    flood.store(true, Ordering::SeqCst);
                }
            }
            Ok(SessionEvent::Disconnect { .. }) => break,
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
