//! # Stream Reader
//!
//! Single point of packet acquisition, shared by the audio and video sample
//! providers. Each provider pulls packets for its own stream index; packets
//! for the other registered stream that arrive first are parked in that
//! stream's pending queue instead of being dropped.
//!
//! ```text
//!                     ┌──────────────────────────────┐
//!  audio provider ───►│ StreamReader                 │
//!                     │  pending[audio] ◄──┐         │
//!  video provider ───►│  pending[video] ◄──┼─ route ◄┼── PacketSource
//!                     │  (unregistered) ───┘ drop    │
//!                     └──────────────────────────────┘
//! ```
//!
//! Everything sits behind one lock: the packet source is not reentrant.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{InteropError, InteropResult};
use crate::packet::{Packet, StreamKind};
use crate::source::{PacketSource, StreamInfo};

// ============================================================================
// State
// ============================================================================

struct ReaderState {
    source: Option<Box<dyn PacketSource>>,
    audio_index: Option<usize>,
    video_index: Option<usize>,
    pending: HashMap<usize, VecDeque<Packet>>,
    end_of_stream: bool,
}

impl ReaderState {
    fn is_registered(&self, index: usize) -> bool {
        self.audio_index == Some(index) || self.video_index == Some(index)
    }

    fn slot(&mut self, kind: StreamKind) -> &mut Option<usize> {
        match kind {
            StreamKind::Audio => &mut self.audio_index,
            StreamKind::Video => &mut self.video_index,
        }
    }
}

pub struct StreamReader {
    state: Mutex<ReaderState>,
    /// Set before the lock is taken on close so a read loop stalled inside
    /// the lock notices on its next packet.
    closed: AtomicBool,
}

impl StreamReader {
    pub fn new(source: Box<dyn PacketSource>) -> Self {
        Self {
            state: Mutex::new(ReaderState {
                source: Some(source),
                audio_index: None,
                video_index: None,
                pending: HashMap::new(),
                end_of_stream: false,
            }),
            closed: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Source metadata
    // ========================================================================

    pub fn streams(&self) -> Vec<StreamInfo> {
        self.state
            .lock()
            .source
            .as_ref()
            .map(|s| s.streams().to_vec())
            .unwrap_or_default()
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.state.lock().source.as_ref().and_then(|s| s.duration_us())
    }

    pub fn format_name(&self) -> Option<&'static str> {
        self.state.lock().source.as_ref().map(|s| s.format_name())
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Route packets of `index` to the audio provider. `None` unregisters.
    pub fn set_audio_stream(&self, index: Option<usize>) {
        self.set_stream(StreamKind::Audio, index);
    }

    /// Route packets of `index` to the video provider. `None` unregisters.
    pub fn set_video_stream(&self, index: Option<usize>) {
        self.set_stream(StreamKind::Video, index);
    }

    fn set_stream(&self, kind: StreamKind, index: Option<usize>) {
        let mut state = self.state.lock();
        let previous = std::mem::replace(state.slot(kind), index);
        if let Some(old) = previous.filter(|&old| Some(old) != index) {
            if !state.is_registered(old) {
                state.pending.remove(&old);
            }
        }
        if let Some(new) = index {
            state.pending.entry(new).or_default();
        }
        tracing::debug!("{} stream: {:?} -> {:?}", kind, previous, index);
    }

    pub fn registered(&self, kind: StreamKind) -> Option<usize> {
        let mut state = self.state.lock();
        *state.slot(kind)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Next packet for `index`: from its pending queue, else read from the
    /// source until one for `index` turns up. `Ok(None)` at end of stream.
    pub fn read_packet_for(&self, index: usize) -> InteropResult<Option<Packet>> {
        if self.is_closed() {
            return Err(InteropError::Closed);
        }

        let mut state = self.state.lock();
        if let Some(packet) = state.pending.get_mut(&index).and_then(VecDeque::pop_front) {
            return Ok(Some(packet));
        }
        if state.end_of_stream {
            return Ok(None);
        }

        loop {
            if self.is_closed() {
                return Err(InteropError::Closed);
            }

            let source = state.source.as_mut().ok_or(InteropError::Closed)?;
            let Some(packet) = source.read_packet()? else {
                tracing::debug!("Packet source reached end of stream");
                state.end_of_stream = true;
                return Ok(None);
            };

            if packet.stream_index == index {
                return Ok(Some(packet));
            }

            if state.is_registered(packet.stream_index) {
                tracing::trace!(
                    "Parking packet for stream {} (pts {:?}) while reading {}",
                    packet.stream_index,
                    packet.pts,
                    index
                );
                state
                    .pending
                    .entry(packet.stream_index)
                    .or_default()
                    .push_back(packet);
            } else {
                tracing::trace!("Dropping packet for unregistered stream {}", packet.stream_index);
            }
        }
    }

    /// Reposition the source. Pending queues are discarded only when the
    /// source accepted the seek.
    pub fn seek(&self, stream_index: usize, timestamp: i64) -> InteropResult<()> {
        if self.is_closed() {
            return Err(InteropError::Closed);
        }

        let mut state = self.state.lock();
        let source = state.source.as_mut().ok_or(InteropError::Closed)?;
        source.seek(stream_index, timestamp)?;

        for queue in state.pending.values_mut() {
            queue.clear();
        }
        state.end_of_stream = false;
        Ok(())
    }

    /// Drop every parked packet of `index` and release the queue's memory.
    pub fn discard_pending(&self, index: usize) {
        if let Some(queue) = self.state.lock().pending.get_mut(&index) {
            queue.clear();
            queue.shrink_to_fit();
        }
    }

    pub fn pending_len(&self, index: usize) -> usize {
        self.state.lock().pending.get(&index).map_or(0, VecDeque::len)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Make every in-flight and future read fail with `Closed`. Does not
    /// take the lock.
    pub fn interrupt(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Unregister both streams and release the source. Idempotent.
    pub fn close(&self) {
        self.interrupt();
        let mut state = self.state.lock();
        state.audio_index = None;
        state.video_index = None;
        state.pending.clear();
        if let Some(source) = state.source.take() {
            tracing::debug!("Releasing {} source", source.format_name());
        }
    }
}
