use crate::frame::{Error, Head};

use bytes::Bytes;

const ACK_FLAG: u8 = 0x1;

pub type Payload = [u8; 8];

#[derive(Debug, Clone, Copy)]
pub struct Ping {
    ack: bool,
    payload: Payload,
}

impl Ping {
    /// Opaque payload marking the liveness pings sent by the keepalive loop.
    pub const KEEPALIVE: Payload = [0; 8];

    /// Opaque payload marking bandwidth-delay-product measurement pings,
    /// distinguishing their ACKs from keepalive ACKs.
    pub const BDP: Payload = [2, 4, 16, 16, 9, 14, 7, 7];

    pub fn ping(payload: Payload) -> Ping {
        Ping {
            ack: false,
            payload,
        }
    }

    pub fn pong(payload: Payload) -> Ping {
        Ping { ack: true, payload }
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn load(head: Head, payload: Bytes) -> Result<Ping, Error> {
        // PING frames are not associated with any individual stream. If a
        // PING frame is received with a stream identifier field value other
        // than 0x0, the recipient MUST respond with a connection error
        // (Section 5.4.1) of type PROTOCOL_ERROR.
        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        // In addition to the frame header, PING frames MUST contain 8 octets
        // of opaque data in the payload.
        if payload.len() != 8 {
            return Err(Error::BadFrameSize);
        }

        let mut data = [0; 8];
        data.copy_from_slice(&payload);

        // The PING frame defines the following flags:
        //
        // ACK (0x1): When set, bit 0 indicates that this PING frame is a PING
        //    response. An endpoint MUST set this flag in PING responses. An
        //    endpoint MUST NOT respond to PING frames containing this flag.
        let ack = head.flag() & ACK_FLAG != 0;

        Ok(Ping { ack, payload: data })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{Kind, StreamId};

    #[test]
    fn load_checks_payload_size() {
        let head = Head::new(Kind::Ping, 0, StreamId::ZERO);
        assert!(matches!(
            Ping::load(head, Bytes::from_static(b"short")),
            Err(Error::BadFrameSize)
        ));
    }

    #[test]
    fn load_rejects_nonzero_stream() {
        let head = Head::new(Kind::Ping, 0, StreamId::new(3));
        assert!(matches!(
            Ping::load(head, Bytes::from_static(b"buoyant_")),
            Err(Error::InvalidStreamId)
        ));
    }

    #[test]
    fn ack_flag() {
        let head = Head::new(Kind::Ping, ACK_FLAG, StreamId::ZERO);
        let ping = Ping::load(head, Bytes::copy_from_slice(&Ping::BDP)).unwrap();
        assert!(ping.is_ack());
        assert_eq!(ping.payload(), &Ping::BDP);
    }
}
