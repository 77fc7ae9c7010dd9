//! H.264 bitstream reformatting.
//!
//! MP4 and Matroska carry length-prefixed NAL units with SPS/PPS out of band
//! in the `avcC` record. The host decoder wants Annex B with the parameter
//! sets in-band, so each packet is rewritten and the parameter sets go in
//! front of the first keyframe (again after every flush).

use bytes::Bytes;

use super::{ProviderBase, ProviderVariant, SampleProvider};
use crate::error::InteropResult;
use crate::h264::{avcc_to_annexb, AvcConfig, NalFraming};
use crate::packet::{Packet, Sample, SideData, StreamKind};
use crate::reader::StreamReader;

/// Most muxers write 4-byte NAL lengths.
const DEFAULT_NAL_LENGTH_SIZE: usize = 4;

pub struct H264SampleProvider {
    base: ProviderBase,
    /// Fixed at construction.
    framing: NalFraming,
    parameter_sets: Bytes,
    needs_parameter_sets: bool,
}

impl H264SampleProvider {
    pub fn new(base: ProviderBase, variant: ProviderVariant, extradata: &[u8]) -> Self {
        let (framing, parameter_sets) = match variant {
            ProviderVariant::H264Avc => match AvcConfig::parse(extradata) {
                Some(config) => (
                    NalFraming::Avc {
                        nal_length_size: config.nal_length_size,
                    },
                    Bytes::from(config.parameter_sets),
                ),
                None => {
                    tracing::warn!(
                        "Unparsable avcC record ({} bytes), assuming {}-byte NAL lengths",
                        extradata.len(),
                        DEFAULT_NAL_LENGTH_SIZE
                    );
                    (
                        NalFraming::Avc {
                            nal_length_size: DEFAULT_NAL_LENGTH_SIZE,
                        },
                        Bytes::new(),
                    )
                }
            },
            // Annex B extradata already is start-code delimited SPS/PPS.
            _ => (NalFraming::AnnexB, Bytes::copy_from_slice(extradata)),
        };

        tracing::debug!(
            "H.264 stream {}: {:?}, {} bytes of parameter sets",
            base.stream_index(),
            framing,
            parameter_sets.len()
        );

        Self {
            base,
            framing,
            parameter_sets,
            needs_parameter_sets: true,
        }
    }

    pub fn framing(&self) -> NalFraming {
        self.framing
    }

    /// Annex B payload for `packet`, with parameter sets in front when this is
    /// the first keyframe since creation or flush.
    fn reformat(&mut self, packet: &Packet) -> InteropResult<(Bytes, Option<SideData>)> {
        let body = match self.framing {
            NalFraming::Avc { nal_length_size } => avcc_to_annexb(&packet.data, nal_length_size)?,
            NalFraming::AnnexB => packet.data.to_vec(),
        };

        if !(packet.keyframe && self.needs_parameter_sets) {
            return Ok((Bytes::from(body), None));
        }
        self.needs_parameter_sets = false;
        if self.parameter_sets.is_empty() {
            return Ok((Bytes::from(body), None));
        }

        let mut payload = Vec::new();
        payload.try_reserve_exact(self.parameter_sets.len() + body.len())?;
        payload.extend_from_slice(&self.parameter_sets);
        payload.extend_from_slice(&body);
        Ok((
            Bytes::from(payload),
            Some(SideData::ParameterSets(self.parameter_sets.clone())),
        ))
    }
}

impl SampleProvider for H264SampleProvider {
    fn kind(&self) -> StreamKind {
        self.base.kind()
    }

    fn stream_index(&self) -> usize {
        self.base.stream_index()
    }

    fn variant(&self) -> ProviderVariant {
        match self.framing {
            NalFraming::Avc { .. } => ProviderVariant::H264Avc,
            NalFraming::AnnexB => ProviderVariant::H264AnnexB,
        }
    }

    fn allocate_resources(&mut self) -> InteropResult<()> {
        Ok(())
    }

    fn get_next_sample(&mut self, reader: &StreamReader) -> InteropResult<Option<Sample>> {
        if self.base.is_end_of_stream() {
            return Ok(None);
        }

        loop {
            let Some(packet) = self.base.read_packet(reader)? else {
                self.base.set_end_of_stream();
                return Ok(None);
            };

            let (data, side_data) = match self.reformat(&packet) {
                Ok(reformatted) => reformatted,
                Err(e) => {
                    tracing::warn!(
                        "Skipping H.264 packet on stream {} (pts {:?}): {}",
                        packet.stream_index,
                        packet.pts,
                        e
                    );
                    continue;
                }
            };

            let timestamp = self.base.timestamp(packet.best_timestamp());
            let duration = self.base.duration(packet.duration);
            return Ok(Some(self.base.make_sample(
                data,
                timestamp,
                duration,
                packet.keyframe,
                side_data,
            )));
        }
    }

    fn flush(&mut self, reader: &StreamReader) {
        self.base.flush(reader);
        self.needs_parameter_sets = true;
    }
}
