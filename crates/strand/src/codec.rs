//! Payload serializer
//!
//! Services exchange serde values packed into opaque [`Payload`] blobs. The
//! scheduler never looks inside them.

use crate::error::Result;
use crate::message::Payload;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value into a payload
pub fn pack<T: Serialize + ?Sized>(value: &T) -> Result<Payload> {
    Ok(Payload::from(serde_json::to_vec(value)?))
}

/// Deserialize a payload produced by [`pack`]
pub fn unpack<T: DeserializeOwned>(payload: &Payload) -> Result<T> {
    Ok(serde_json::from_slice(payload.as_bytes())?)
}

/// Deserialize and release the payload in one step
pub fn unpack_owned<T: DeserializeOwned>(payload: Payload) -> Result<T> {
    unpack(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[test]
    fn test_pack_unpack_struct() {
        let payload = pack(&Ping {
            seq: 3,
            note: "hi".into(),
        })
        .unwrap();
        let back: Ping = unpack(&payload).unwrap();
        assert_eq!(back.seq, 3);
        assert_eq!(back.note, "hi");
    }

    #[test]
    fn test_unpack_garbage_is_codec_error() {
        let payload = Payload::from(&b"\xff\x00"[..]);
        let err = unpack::<Ping>(&payload).unwrap_err();
        assert!(matches!(err, RuntimeError::Codec(_)));
    }
}
