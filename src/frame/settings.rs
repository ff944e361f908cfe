use crate::frame::{Error, Head, StreamId, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE};

use bytes::BufMut;

const ACK_FLAG: u8 = 0x1;

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// A SETTINGS frame: the known parameters, each optionally present.
/// Unknown identifiers are ignored as the RFC requires.
#[derive(Debug, Default, Clone)]
pub struct Settings {
    ack: bool,
    header_table_size: Option<u32>,
    enable_push: Option<u32>,
    max_concurrent_streams: Option<u32>,
    initial_window_size: Option<u32>,
    max_frame_size: Option<u32>,
    max_header_list_size: Option<u32>,
}

impl Settings {
    pub fn new() -> Settings {
        Settings::default()
    }

    pub fn ack() -> Settings {
        Settings {
            ack: true,
            ..Settings::default()
        }
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Settings, Error> {
        debug_assert_eq!(head.kind(), crate::frame::Kind::Settings);

        // SETTINGS frames always apply to a connection, never a single
        // stream.
        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        if head.flag() & ACK_FLAG == ACK_FLAG {
            // Receipt of a SETTINGS frame with the ACK flag set and a length
            // field value other than 0 MUST be treated as a connection error
            // of type FRAME_SIZE_ERROR.
            if !payload.is_empty() {
                return Err(Error::InvalidPayloadAckSettings);
            }
            return Ok(Settings::ack());
        }

        if payload.len() % 6 != 0 {
            return Err(Error::PartialSettingLength);
        }

        let mut settings = Settings::new();
        for chunk in payload.chunks(6) {
            let id = (chunk[0] as u16) << 8 | chunk[1] as u16;
            let val = unpack_octets_4!(chunk, 2, u32);

            match id {
                HEADER_TABLE_SIZE => settings.header_table_size = Some(val),
                ENABLE_PUSH => {
                    if val > 1 {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.enable_push = Some(val);
                }
                MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(val),
                INITIAL_WINDOW_SIZE => {
                    if val > MAX_WINDOW_SIZE {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.initial_window_size = Some(val);
                }
                MAX_FRAME_SIZE => {
                    if !(16_384..=MAX_MAX_FRAME_SIZE).contains(&val) {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.max_frame_size = Some(val);
                }
                MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(val),
                // An endpoint that receives a SETTINGS frame with any unknown
                // or unsupported identifier MUST ignore that setting.
                _ => {}
            }
        }

        Ok(settings)
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let head = Head::new(
            crate::frame::Kind::Settings,
            if self.ack { ACK_FLAG } else { 0 },
            StreamId::ZERO,
        );
        let payload_len = self.payload_len();

        head.encode(payload_len, dst);

        let mut put = |id: u16, val: Option<u32>| {
            if let Some(val) = val {
                dst.put_u16(id);
                dst.put_u32(val);
            }
        };
        put(HEADER_TABLE_SIZE, self.header_table_size);
        put(ENABLE_PUSH, self.enable_push);
        put(MAX_CONCURRENT_STREAMS, self.max_concurrent_streams);
        put(INITIAL_WINDOW_SIZE, self.initial_window_size);
        put(MAX_FRAME_SIZE, self.max_frame_size);
        put(MAX_HEADER_LIST_SIZE, self.max_header_list_size);
    }

    fn payload_len(&self) -> usize {
        let mut len = 0;
        let mut count = |val: Option<u32>| {
            if val.is_some() {
                len += 6;
            }
        };
        count(self.header_table_size);
        count(self.enable_push);
        count(self.max_concurrent_streams);
        count(self.initial_window_size);
        count(self.max_frame_size);
        count(self.max_header_list_size);
        len
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn header_table_size(&self) -> Option<u32> {
        self.header_table_size
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn set_max_concurrent_streams(&mut self, val: Option<u32>) {
        self.max_concurrent_streams = val;
    }

    pub fn initial_window_size(&self) -> Option<u32> {
        self.initial_window_size
    }

    pub fn set_initial_window_size(&mut self, val: Option<u32>) {
        self.initial_window_size = val;
    }

    pub fn max_frame_size(&self) -> Option<u32> {
        self.max_frame_size
    }

    pub fn max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    pub fn set_max_header_list_size(&mut self, val: Option<u32>) {
        self.max_header_list_size = val;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::Kind;
    use bytes::BytesMut;

    fn round_trip(settings: &Settings) -> Settings {
        let mut buf = BytesMut::new();
        settings.encode(&mut buf);
        let head = Head::parse(&buf);
        Settings::load(head, &buf[crate::frame::HEADER_LEN..]).unwrap()
    }

    #[test]
    fn encode_then_load() {
        let mut settings = Settings::new();
        settings.set_initial_window_size(Some(262_144));
        settings.set_max_concurrent_streams(Some(10));

        let parsed = round_trip(&settings);
        assert_eq!(parsed.initial_window_size(), Some(262_144));
        assert_eq!(parsed.max_concurrent_streams(), Some(10));
        assert_eq!(parsed.max_frame_size(), None);
        assert!(!parsed.is_ack());
    }

    #[test]
    fn ack_with_payload_is_rejected() {
        let head = Head::new(Kind::Settings, ACK_FLAG, StreamId::ZERO);
        assert!(matches!(
            Settings::load(head, &[0; 6]),
            Err(Error::InvalidPayloadAckSettings)
        ));
    }

    #[test]
    fn oversized_window_setting_is_rejected() {
        let mut buf = BytesMut::new();
        let head = Head::new(Kind::Settings, 0, StreamId::ZERO);
        head.encode(6, &mut buf);
        buf.put_u16(INITIAL_WINDOW_SIZE);
        buf.put_u32(1 << 31);
        let head = Head::parse(&buf);
        assert!(matches!(
            Settings::load(head, &buf[crate::frame::HEADER_LEN..]),
            Err(Error::InvalidSettingValue)
        ));
    }

    #[test]
    fn unknown_settings_are_ignored() {
        let mut buf = BytesMut::new();
        let head = Head::new(Kind::Settings, 0, StreamId::ZERO);
        head.encode(12, &mut buf);
        buf.put_u16(0x99);
        buf.put_u32(1);
        buf.put_u16(MAX_CONCURRENT_STREAMS);
        buf.put_u32(128);
        let head = Head::parse(&buf);
        let settings = Settings::load(head, &buf[crate::frame::HEADER_LEN..]).unwrap();
        assert_eq!(settings.max_concurrent_streams(), Some(128));
    }
}
