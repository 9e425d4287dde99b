use std::marker::PhantomData;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::channel::message::{Inbound, Outbound};

/// Maximum frame payload size: 1 MB.
const MAX_FRAME_SIZE: usize = 1_048_576;

/// Length-prefixed JSON frame codec for the backend channel.
///
/// `Tx` is the message type written to the wire, `Rx` the type read
/// from it, so the same codec serves both ends of the channel.
pub struct EnvelopeCodec<Tx, Rx> {
    inner: LengthDelimitedCodec,
    _direction: PhantomData<fn(Tx) -> Rx>,
}

/// Codec for the orchestrator side: sends commands, receives pushes.
pub type ClientCodec = EnvelopeCodec<Outbound, Inbound>;

/// Codec for the backend side. Used by fake backends in tests.
pub type BackendCodec = EnvelopeCodec<Inbound, Outbound>;

impl<Tx, Rx> EnvelopeCodec<Tx, Rx> {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_SIZE)
            .length_adjustment(0)
            .new_codec();

        Self {
            inner,
            _direction: PhantomData,
        }
    }
}

impl<Tx, Rx> Default for EnvelopeCodec<Tx, Rx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx: Serialize, Rx> Encoder<Tx> for EnvelopeCodec<Tx, Rx> {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Tx, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).context("failed to serialize message")?;
        let bytes = Bytes::from(json);
        self.inner.encode(bytes, dst).map_err(|e| anyhow::anyhow!(e))
    }
}

impl<Tx, Rx: DeserializeOwned> Decoder for EnvelopeCodec<Tx, Rx> {
    type Item = Rx;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(|e| anyhow::anyhow!(e))? {
            Some(bytes) => {
                let msg = serde_json::from_slice(&bytes).context("failed to deserialize message")?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}
