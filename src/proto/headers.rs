//! Decoding of response headers and trailers into RPC semantics.

use crate::frame::HeaderField;
use crate::metadata::{self, Metadata};
use crate::status::{self, BizStatus, Code, Status};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};

/// Everything a meta-headers frame can tell us: transport-level fields,
/// RPC status, business status and user metadata.
#[derive(Debug, Default)]
pub(crate) struct DecodeState {
    pub encoding: Option<String>,
    pub mdata: Metadata,

    raw_status_code: Option<i32>,
    status_message: String,
    status_details: Option<Bytes>,

    http_status: Option<u16>,
    is_grpc: bool,

    biz_status_code: Option<i32>,
    biz_message: String,
    biz_extra: Option<String>,
}

impl DecodeState {
    /// Decodes one header block. `speaking_grpc` is true once a previous
    /// header block already established the peer speaks the protocol, which
    /// waives the content-type requirement for trailers.
    pub fn decode(fields: &[HeaderField], speaking_grpc: bool) -> Result<DecodeState, Status> {
        let mut ds = DecodeState {
            is_grpc: speaking_grpc,
            ..DecodeState::default()
        };

        for field in fields {
            ds.process_field(field)?;
        }
        ds.validate()?;
        Ok(ds)
    }

    fn process_field(&mut self, field: &HeaderField) -> Result<(), Status> {
        let value = field.value.as_str();
        match field.name.as_str() {
            ":status" => {
                let code: u16 = value.parse().map_err(|_| {
                    Status::new(
                        Code::Internal,
                        format!("transport: malformed http-status: {}", value),
                    )
                })?;
                self.http_status = Some(code);
            }
            "content-type" => {
                if content_subtype(value).is_some() {
                    self.is_grpc = true;
                }
            }
            "grpc-encoding" => self.encoding = Some(value.to_owned()),
            "grpc-status" => {
                let code: i32 = value.parse().map_err(|_| {
                    Status::new(
                        Code::Internal,
                        format!("transport: malformed grpc-status: {}", value),
                    )
                })?;
                self.raw_status_code = Some(code);
            }
            "grpc-message" => self.status_message = status::decode_grpc_message(value),
            "grpc-status-details-bin" => {
                let raw = URL_SAFE_NO_PAD.decode(value).map_err(|_| {
                    Status::new(
                        Code::Internal,
                        "transport: malformed grpc-status-details-bin",
                    )
                })?;
                self.status_details = Some(Bytes::from(raw));
            }
            "biz-status" => self.biz_status_code = value.parse().ok(),
            "biz-message" => self.biz_message = value.to_owned(),
            "biz-extra" => self.biz_extra = Some(value.to_owned()),
            name if name.starts_with(':') => {}
            name if metadata::is_reserved_header(name) => {}
            name => {
                // User metadata; binary values stay in wire form.
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    self.mdata.append_raw(name, value);
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), Status> {
        if let Some(http_status) = self.http_status {
            if http_status != 200 {
                let code = status::code_from_http_status(http_status);
                return Err(Status::new(
                    code,
                    format!(
                        "transport: received unexpected HTTP status code {} from server",
                        http_status
                    ),
                ));
            }
        }
        if !self.is_grpc {
            return Err(Status::new(
                Code::Internal,
                "transport: missing or unexpected content-type in response headers",
            ));
        }
        Ok(())
    }

    /// The final status carried by an END_STREAM header block.
    pub fn status(&self) -> Status {
        match self.raw_status_code {
            Some(raw) => {
                let code = match Code::from_i32(raw) {
                    Some(code) => code,
                    None => {
                        return Status::new(
                            Code::Unknown,
                            format!("transport: unknown grpc-status {}", raw),
                        )
                    }
                };
                let mut st = Status::new(code, self.status_message.clone());
                if let Some(details) = &self.status_details {
                    st = st.with_details(details.clone());
                }
                st
            }
            None => Status::new(Code::Unknown, "server sent trailers without grpc-status"),
        }
    }

    pub fn biz_status(&self) -> Option<BizStatus> {
        self.biz_status_code.map(|code| BizStatus {
            status_code: code,
            message: self.biz_message.clone(),
            extra: self.biz_extra.clone(),
        })
    }
}

/// Splits a `content-type` value, returning the subtype ("" for the bare
/// protocol content type) when the value belongs to the protocol.
pub(crate) fn content_subtype(value: &str) -> Option<&str> {
    let rest = value.strip_prefix("application/grpc")?;
    match rest.as_bytes().first() {
        None => Some(""),
        Some(b'+') | Some(b';') => Some(&rest[1..]),
        _ => None,
    }
}

/// The `content-type` header value for a given subtype.
pub(crate) fn content_type(subtype: Option<&str>) -> String {
    match subtype {
        Some(sub) if !sub.is_empty() => format!("application/grpc+{}", sub),
        _ => "application/grpc".to_owned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn field(name: &str, value: &str) -> HeaderField {
        HeaderField::new(name, value)
    }

    #[test]
    fn initial_headers_decode() {
        let fields = [
            field(":status", "200"),
            field("content-type", "application/grpc"),
            field("grpc-encoding", "gzip"),
            field("x-trace-id", "abc123"),
        ];
        let ds = DecodeState::decode(&fields, false).unwrap();
        assert_eq!(ds.encoding.as_deref(), Some("gzip"));
        assert_eq!(ds.mdata.get("x-trace-id"), Some("abc123"));
        // Transport-owned fields never leak into user metadata.
        assert!(ds.mdata.get("content-type").is_none());
    }

    #[test]
    fn trailers_decode_status() {
        let fields = [
            field("grpc-status", "8"),
            field("grpc-message", "quota%20exceeded"),
            // "details" in the unpadded url-safe alphabet.
            field("grpc-status-details-bin", "ZGV0YWlscw"),
        ];
        let ds = DecodeState::decode(&fields, true).unwrap();
        let st = ds.status();
        assert_eq!(st.code(), Code::ResourceExhausted);
        assert_eq!(st.message(), "quota exceeded");
        assert_eq!(&st.details_bin().unwrap()[..], b"details");
    }

    #[test]
    fn missing_grpc_status_in_trailers() {
        let ds = DecodeState::decode(&[], true).unwrap();
        assert_eq!(ds.status().code(), Code::Unknown);
    }

    #[test]
    fn non_200_http_status_is_mapped() {
        let fields = [field(":status", "503")];
        let err = DecodeState::decode(&fields, false).unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[test]
    fn missing_content_type_fails_initial_headers() {
        let fields = [field(":status", "200")];
        let err = DecodeState::decode(&fields, false).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn business_status_is_surfaced() {
        let fields = [
            field("grpc-status", "0"),
            field("biz-status", "1042"),
            field("biz-message", "insufficient balance"),
        ];
        let ds = DecodeState::decode(&fields, true).unwrap();
        let biz = ds.biz_status().unwrap();
        assert_eq!(biz.status_code, 1042);
        assert_eq!(biz.message, "insufficient balance");
        assert!(ds.status().is_ok());
    }

    #[test]
    fn content_subtype_parsing() {
        assert_eq!(content_subtype("application/grpc"), Some(""));
        assert_eq!(content_subtype("application/grpc+proto"), Some("proto"));
        assert_eq!(content_subtype("application/json"), None);
        assert_eq!(content_type(Some("proto")), "application/grpc+proto");
        assert_eq!(content_type(None), "application/grpc");
    }
}
