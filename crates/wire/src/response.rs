// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Response encoding (§6): zero bytes is success, one byte is a numeric
//! error code, anything longer is a human-readable text payload.

use hsm_core::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success,
    Error(ErrorKind),
    Text(String),
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Success => Vec::new(),
            Response::Error(kind) => vec![kind.code()],
            Response::Text(text) => text.clone().into_bytes(),
        }
    }

    pub fn decode(datagram: &[u8]) -> Self {
        match datagram.len() {
            0 => Response::Success,
            1 => match ErrorKind::from_code(datagram[0]) {
                Some(kind) => Response::Error(kind),
                None => Response::Text(String::from_utf8_lossy(datagram).into_owned()),
            },
            _ => Response::Text(String::from_utf8_lossy(datagram).into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_encodes_to_empty_body() {
        assert_eq!(Response::Success.encode(), Vec::<u8>::new());
        assert_eq!(Response::decode(&[]), Response::Success);
    }

    #[test]
    fn error_round_trips_through_single_byte() {
        let response = Response::Error(ErrorKind::Busy);
        let encoded = response.encode();
        assert_eq!(encoded.len(), 1);
        assert_eq!(Response::decode(&encoded), response);
    }

    #[test]
    fn text_round_trips() {
        let response = Response::Text("stale".to_string());
        let encoded = response.encode();
        assert_eq!(Response::decode(&encoded), response);
    }
}
