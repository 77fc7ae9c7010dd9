//! Compressed samples forwarded unmodified.

use super::{ProviderBase, ProviderVariant, SampleProvider};
use crate::error::InteropResult;
use crate::packet::{Sample, StreamKind};
use crate::reader::StreamReader;

pub struct PassthroughSampleProvider {
    base: ProviderBase,
}

impl PassthroughSampleProvider {
    pub fn new(base: ProviderBase) -> Self {
        Self { base }
    }
}

impl SampleProvider for PassthroughSampleProvider {
    fn kind(&self) -> StreamKind {
        self.base.kind()
    }

    fn stream_index(&self) -> usize {
        self.base.stream_index()
    }

    fn variant(&self) -> ProviderVariant {
        ProviderVariant::Passthrough
    }

    fn allocate_resources(&mut self) -> InteropResult<()> {
        Ok(())
    }

    fn get_next_sample(&mut self, reader: &StreamReader) -> InteropResult<Option<Sample>> {
        if self.base.is_end_of_stream() {
            return Ok(None);
        }
        let Some(packet) = self.base.read_packet(reader)? else {
            self.base.set_end_of_stream();
            return Ok(None);
        };

        let timestamp = self.base.timestamp(packet.best_timestamp());
        let duration = self.base.duration(packet.duration);
        // Audio frames are all sync points.
        let keyframe = packet.keyframe || self.base.kind() == StreamKind::Audio;
        Ok(Some(self.base.make_sample(
            packet.data,
            timestamp,
            duration,
            keyframe,
            None,
        )))
    }

    fn flush(&mut self, reader: &StreamReader) {
        self.base.flush(reader);
    }
}
