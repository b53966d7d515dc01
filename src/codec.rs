//! Pass-through gRPC codec.
//!
//! Workers already speak protobuf, so proxied calls never decode the
//! message on the bridge: [`RawCodec`] hands the request body to the
//! worker as-is and writes the worker's reply body back unchanged.
//!
//! Payload types are chosen per method through the [`Payload`] trait:
//!
//! - [`RawMessage`] — opaque bytes, copied through without (de)serialization
//! - [`Typed<M>`] — any `prost::Message`, handed to tonic's own
//!   `ProstCodec` encoder and decoder; used by in-process services such
//!   as the control plane
//!
//! ```rust,ignore
//! // proxy route: bytes in, bytes out
//! let codec = RawCodec::<RawMessage, RawMessage>::default();
//! // typed route: same codec type, ordinary protobuf messages
//! let codec = RawCodec::<Typed<StatusResponse>, Typed<StatusRequest>>::default();
//! ```

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes};
use tonic::Status;
use tonic::codec::{
    BufferSettings, Codec, DecodeBuf, Decoder, EncodeBuf, Encoder, ProstCodec,
};

// tonic keeps its prost encoder/decoder types private; name them through the codec.
type ProstEncoder<M> = <ProstCodec<M, M> as Codec>::Encoder;
type ProstDecoder<M> = <ProstCodec<M, M> as Codec>::Decoder;

/// An already-encoded protobuf message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage(Bytes);

impl RawMessage {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for RawMessage {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for RawMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for RawMessage {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

/// A typed protobuf message routed through [`RawCodec`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Typed<M>(pub M);

impl<M> Typed<M> {
    pub fn into_inner(self) -> M {
        self.0
    }
}

/// A message type [`RawCodec`] knows how to move across the wire.
pub trait Payload: Sized + Send + 'static {
    type Encoder: Encoder<Item = Self, Error = Status> + Send + 'static;
    type Decoder: Decoder<Item = Self, Error = Status> + Send + 'static;

    fn encoder() -> Self::Encoder;

    fn decoder() -> Self::Decoder;
}

impl Payload for RawMessage {
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder() -> Self::Encoder {
        RawEncoder
    }

    fn decoder() -> Self::Decoder {
        RawDecoder
    }
}

impl<M> Payload for Typed<M>
where
    M: prost::Message + Default + Send + 'static,
{
    type Encoder = TypedEncoder<M>;
    type Decoder = TypedDecoder<M>;

    fn encoder() -> Self::Encoder {
        TypedEncoder(ProstCodec::<M, M>::default().encoder())
    }

    fn decoder() -> Self::Decoder {
        TypedDecoder(ProstCodec::<M, M>::default().decoder())
    }
}

/// gRPC codec over [`Payload`] types. `T` is encoded, `U` is decoded.
#[derive(Debug)]
pub struct RawCodec<T = RawMessage, U = RawMessage> {
    _pd: PhantomData<fn() -> (T, U)>,
}

impl<T, U> Default for RawCodec<T, U> {
    fn default() -> Self {
        Self { _pd: PhantomData }
    }
}

impl<T, U> Clone for RawCodec<T, U> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<T: Payload, U: Payload> Codec for RawCodec<T, U> {
    type Encode = T;
    type Decode = U;
    type Encoder = T::Encoder;
    type Decoder = U::Decoder;

    fn encoder(&mut self) -> Self::Encoder {
        T::encoder()
    }

    fn decoder(&mut self) -> Self::Decoder {
        U::decoder()
    }
}

/// Writes [`RawMessage`] bytes as the message body.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = RawMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item.0);
        Ok(())
    }
}

/// Takes the whole message body as a [`RawMessage`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = RawMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(RawMessage(src.copy_to_bytes(src.remaining()))))
    }
}

/// tonic's prost encoder, carrying [`Typed`] values.
pub struct TypedEncoder<M: prost::Message + Default + Send + 'static>(ProstEncoder<M>);

impl<M: prost::Message + Default + Send + 'static> Encoder for TypedEncoder<M> {
    type Item = Typed<M>;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        self.0.encode(item.0, dst)
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.0.buffer_settings()
    }
}

/// tonic's prost decoder, producing [`Typed`] values.
pub struct TypedDecoder<M: prost::Message + Default + Send + 'static>(ProstDecoder<M>);

impl<M: prost::Message + Default + Send + 'static> Decoder for TypedDecoder<M> {
    type Item = Typed<M>;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.0.decode(src)?.map(Typed))
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.0.buffer_settings()
    }
}
